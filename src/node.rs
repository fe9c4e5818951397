use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result, StoreError};
use crate::scheduler::{
    finish_if, DeadLetter, Dispatcher, Job, JobResult, JobStatus, JobStore, MemoryJobStore,
    Priority, PriorityQueues, RateLimiter, RecoveryReaper, Target, UpdateOutcome,
};
use crate::worker::{EnvironmentProvider, ExecutionManager, LogSubscription, TerminateReason};

/// A validated submission from the front door.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub submitter_id: String,
    pub target: Target,
    #[serde(default)]
    pub priority: Priority,
    /// Clamped into the configured bounds; defaults when absent
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl JobRequest {
    pub fn new(submitter_id: impl Into<String>, target: Target, priority: Priority) -> Self {
        Self {
            submitter_id: submitter_id.into(),
            target,
            priority,
            timeout_seconds: None,
        }
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }
}

/// Wires the store, queues, rate limiter, dispatcher, execution manager and
/// reaper together, and exposes the operations the front door calls.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    queues: Arc<PriorityQueues>,
    limiter: Arc<RateLimiter>,
    manager: ExecutionManager,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, provider: Arc<dyn EnvironmentProvider>) -> Self {
        Self::with_store(config, provider, Arc::new(MemoryJobStore::new()))
    }

    pub fn with_store(
        config: OrchestratorConfig,
        provider: Arc<dyn EnvironmentProvider>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            queues: Arc::new(PriorityQueues::new(config.queue.clone())),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            manager: ExecutionManager::new(provider, config.timeouts.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queues(&self) -> &Arc<PriorityQueues> {
        &self.queues
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.manager
    }

    /// Record the job as `queued`, then enqueue it. If the enqueue fails the
    /// record is removed again so no job exists that can never be scheduled.
    pub async fn submit(&self, request: JobRequest) -> Result<Job> {
        validate(&request)?;

        let timeout_seconds = self
            .config
            .timeouts
            .clamp_job_timeout(request.timeout_seconds);
        let job = Job::new(
            request.submitter_id,
            request.target,
            request.priority,
            timeout_seconds,
        );
        let job_id = job.id;
        self.store.insert(job).await?;

        if let Err(e) = self.queues.enqueue(job_id, request.priority) {
            tracing::warn!(job_id = %job_id, error = %e, "Enqueue failed, rolling back submission");
            if let Err(rollback) = self.store.remove(&job_id).await {
                tracing::error!(job_id = %job_id, error = %rollback, "Rollback failed");
            }
            return Err(e.into());
        }

        tracing::info!(
            job_id = %job_id,
            priority = %request.priority,
            timeout_seconds,
            "Job submitted"
        );
        self.get_status(&job_id).await
    }

    pub async fn get_status(&self, job_id: &Uuid) -> Result<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(*job_id))
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store.list_all().await?)
    }

    /// Cancel a queued or running job.
    ///
    /// A queued job becomes `cancelled` at once and its message is discarded
    /// when delivered. A running job's unit is told to stop and the job turns
    /// `cancelled` through the normal exit path. Returns the job as stored
    /// when the call returns.
    pub async fn cancel(&self, job_id: &Uuid) -> Result<Job> {
        let job = self.get_status(job_id).await?;
        match job.status {
            JobStatus::Queued => {
                let outcome = finish_if(
                    self.store.as_ref(),
                    job_id,
                    &[JobStatus::Queued],
                    JobStatus::Cancelled,
                    JobResult::error("cancelled by request"),
                )
                .await
                .map_err(not_found)?;
                match outcome {
                    UpdateOutcome::Applied(job) => {
                        tracing::info!(job_id = %job_id, "Queued job cancelled");
                        Ok(job)
                    }
                    // Dispatched meanwhile; cancel the running unit instead.
                    UpdateOutcome::Skipped(job) if job.status == JobStatus::Running => {
                        self.cancel_running(job).await
                    }
                    UpdateOutcome::Skipped(job) => Err(OrchestratorError::InvalidState {
                        job_id: *job_id,
                        status: job.status,
                    }),
                }
            }
            JobStatus::Running => self.cancel_running(job).await,
            status => Err(OrchestratorError::InvalidState {
                job_id: *job_id,
                status,
            }),
        }
    }

    async fn cancel_running(&self, job: Job) -> Result<Job> {
        if self.manager.terminate(&job.id, TerminateReason::Cancel) {
            return Ok(job);
        }
        if self.manager.events().contains_job(&job.id) {
            // The unit already exited; that exit settles the job.
            tracing::debug!(job_id = %job.id, "Cancel raced unit exit, leaving exit to settle job");
            return self.get_status(&job.id).await;
        }

        // No local unit owns the job; settle it directly.
        let outcome = finish_if(
            self.store.as_ref(),
            &job.id,
            &[JobStatus::Running],
            JobStatus::Cancelled,
            JobResult::error("cancelled by request"),
        )
        .await
        .map_err(not_found)?;
        match outcome {
            UpdateOutcome::Applied(job) => {
                tracing::info!(job_id = %job.id, "Orphaned running job cancelled");
                Ok(job)
            }
            UpdateOutcome::Skipped(current) => Err(OrchestratorError::InvalidState {
                job_id: current.id,
                status: current.status,
            }),
        }
    }

    /// Follow a job's agent output while it has a live unit.
    pub fn attach_logs(&self, job_id: &Uuid) -> Option<LogSubscription> {
        self.manager.attach_logs(job_id)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queues.dead_letters().entries()
    }

    /// Start the dispatcher and the reaper. Both stop when `shutdown` fires.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.queues.clone(),
            self.limiter.clone(),
            self.manager.clone(),
            self.config.clone(),
        );
        let reaper = RecoveryReaper::new(
            self.store.clone(),
            self.manager.clone(),
            self.config.timeouts.clone(),
        );

        tokio::spawn(async move {
            let reaper = tokio::spawn(reaper.run(shutdown.clone()));
            dispatcher.run(shutdown).await;
            let _ = reaper.await;
        })
    }
}

fn validate(request: &JobRequest) -> Result<()> {
    if request.submitter_id.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "submitter_id must not be empty".to_string(),
        ));
    }
    let url = request.target.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(OrchestratorError::Validation(format!(
            "target url must be http(s), got '{}'",
            request.target.url
        )));
    }
    Ok(())
}

fn not_found(e: StoreError) -> OrchestratorError {
    match e {
        StoreError::NotFound(id) => OrchestratorError::JobNotFound(id),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> JobRequest {
        JobRequest::new("user-1", Target::new(url), Priority::Normal)
    }

    #[test]
    fn rejects_empty_submitter() {
        let mut req = request("https://example.com");
        req.submitter_id = "  ".to_string();
        assert!(matches!(
            validate(&req),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn rejects_non_http_targets() {
        assert!(validate(&request("file:///etc/passwd")).is_err());
        assert!(validate(&request("")).is_err());
        assert!(validate(&request("https://example.com/page")).is_ok());
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: JobRequest = serde_json::from_str(
            r#"{"submitter_id": "u", "target": {"url": "https://example.com"}}"#,
        )
        .unwrap();
        assert_eq!(req.priority, Priority::Normal);
        assert_eq!(req.timeout_seconds, None);
        assert!(req.target.params.is_empty());
    }
}
