use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::{JobStatus, Priority};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {job_id} is {status}, operation not allowed")]
    InvalidState { job_id: Uuid, status: JobStatus },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failures of the job store's conditional-write interface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Version conflict on job {job_id}: expected {expected}, found {actual}")]
    VersionConflict {
        job_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Too many concurrent writers on job {0}")]
    Contended(Uuid),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("{priority} queue is full ({capacity} messages)")]
    Full { priority: Priority, capacity: usize },
}

/// Failures surfaced by the execution environment manager and its providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("Compute pool exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("Unit not ready within {0:?}")]
    StartTimeout(Duration),

    #[error("Job {0} already has an active execution")]
    AlreadyActive(Uuid),

    #[error("Unit error: {0}")]
    Unit(String),
}

impl EnvironmentError {
    /// Whether the dispatcher should retry the start on a later delivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EnvironmentError::AlreadyActive(_))
    }
}
