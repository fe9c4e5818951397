//! Job Store: the system of record for job state.
//!
//! The storage engine itself is an external collaborator; this module fixes
//! the contract it must honour (a key-value store with conditional writes) and
//! ships an in-memory implementation used by the binary and the tests.
//!
//! Every mutation goes through [`JobStore::compare_and_swap`], which commits
//! only if the stored record still carries the version the writer read. On
//! top of that, [`update_if`] adds a status precondition so that racing
//! writers (dispatcher vs. reaper, duplicate deliveries) resolve as
//! "first writer wins, second is a no-op".

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::job::{Job, JobResult, JobStatus};

/// Conflicting writers retry this many times before giving up.
const MAX_CAS_RETRIES: usize = 16;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a record. Fails if the id is already present.
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    async fn get(&self, id: &Uuid) -> Result<Option<Job>, StoreError>;

    /// Delete a record, used only to roll back a submission that never became schedulable.
    async fn remove(&self, id: &Uuid) -> Result<Option<Job>, StoreError>;

    /// Replace the record if its stored version equals `expected_version`.
    /// Returns the committed record with its new version.
    async fn compare_and_swap(&self, job: Job, expected_version: u64) -> Result<Job, StoreError>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    /// All records sorted by creation time.
    async fn list_all(&self) -> Result<Vec<Job>, StoreError>;
}

/// Result of a guarded update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The precondition held and the write committed.
    Applied(Job),
    /// The job was not in an expected status; nothing was written.
    Skipped(Job),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }

}

/// Apply `mutate` to the job if its status is one of `expected`.
///
/// Version conflicts are retried against a fresh read. A mutation that moves
/// the job along an edge the lifecycle DAG forbids is rejected.
pub async fn update_if<F>(
    store: &dyn JobStore,
    id: &Uuid,
    expected: &[JobStatus],
    mut mutate: F,
) -> Result<UpdateOutcome, StoreError>
where
    F: FnMut(&mut Job) + Send,
{
    for _ in 0..MAX_CAS_RETRIES {
        let current = store.get(id).await?.ok_or(StoreError::NotFound(*id))?;
        if !expected.contains(&current.status) {
            return Ok(UpdateOutcome::Skipped(current));
        }

        let mut next = current.clone();
        mutate(&mut next);
        if next.status != current.status && !current.status.can_transition_to(next.status) {
            return Err(StoreError::InvalidTransition {
                job_id: *id,
                from: current.status,
                to: next.status,
            });
        }

        match store.compare_and_swap(next, current.version).await {
            Ok(committed) => return Ok(UpdateOutcome::Applied(committed)),
            Err(StoreError::VersionConflict { .. }) => {
                tracing::debug!(job_id = %id, "Version conflict, retrying conditional update");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Contended(*id))
}

/// Move a job into a terminal state, guarded on it currently being in `from`.
pub async fn finish_if(
    store: &dyn JobStore,
    id: &Uuid,
    from: &[JobStatus],
    status: JobStatus,
    result: JobResult,
) -> Result<UpdateOutcome, StoreError> {
    update_if(store, id, from, |job| {
        job.finish(status, result.clone(), Utc::now());
    })
    .await
}

/// In-memory job store with versioned records.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current number of records
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Returns true if the store holds no records
    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, mut job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        job.version = 1;
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn remove(&self, id: &Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.write().await.remove(id))
    }

    async fn compare_and_swap(
        &self,
        mut job: Job,
        expected_version: u64,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get(&job.id).ok_or(StoreError::NotFound(job.id))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                job_id: job.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        job.version = expected_version + 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
