use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EnvironmentError;
use crate::scheduler::Job;
use crate::worker::logs::LogSink;

/// Everything a provider needs to start one agent for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub job_id: Uuid,
    pub target_url: String,
    pub params: BTreeMap<String, String>,
    pub timeout_seconds: u64,
}

impl UnitSpec {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            target_url: job.target.url.clone(),
            params: job.target.params.clone(),
            timeout_seconds: job.timeout_seconds,
        }
    }
}

/// What a unit reported when its agent process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitExit {
    pub exit_code: i32,
    pub artifact_ref: Option<String>,
    pub logs_ref: Option<String>,
    pub error: Option<String>,
}

impl UnitExit {
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }
}

/// A running, isolated agent.
///
/// `wait` may be called again after an earlier call was dropped, which the
/// manager does when it interrupts a wait to stop the unit.
#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    fn id(&self) -> &str;

    /// Resolve when the agent process ends.
    async fn wait(&self) -> Result<UnitExit, EnvironmentError>;

    /// Ask the agent to stop (SIGTERM or equivalent).
    async fn signal_stop(&self) -> Result<(), EnvironmentError>;

    /// Stop the agent immediately.
    async fn kill(&self) -> Result<(), EnvironmentError>;
}

/// Source of execution units: containers, sandboxes, VMs.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Create a unit and start its agent. Returns once the unit is ready.
    async fn provision(
        &self,
        spec: &UnitSpec,
        logs: LogSink,
    ) -> Result<Arc<dyn ExecutionUnit>, EnvironmentError>;

    /// Release every resource held for `job_id`. Must be idempotent and safe
    /// to call while a provision for the same job is still in progress.
    async fn force_remove(&self, job_id: &Uuid);
}
