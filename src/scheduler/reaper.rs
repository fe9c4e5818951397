use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::error::StoreError;
use crate::scheduler::dispatcher::apply_exit;
use crate::scheduler::job::{JobResult, JobStatus};
use crate::scheduler::store::{finish_if, JobStore, UpdateOutcome};
use crate::worker::{ExecutionManager, ExitConsumer, TerminateReason};

/// Backstop that keeps `running` jobs from being orphaned.
///
/// It reads the exit log from its own cursor, independent of the dispatcher,
/// and periodically sweeps for running jobs that outlived every timer without
/// any exit being reported.
pub struct RecoveryReaper {
    store: Arc<dyn JobStore>,
    manager: ExecutionManager,
    timeouts: TimeoutConfig,
    cursor: u64,
}

impl RecoveryReaper {
    pub fn new(store: Arc<dyn JobStore>, manager: ExecutionManager, timeouts: TimeoutConfig) -> Self {
        manager.events().register(ExitConsumer::Reaper);
        Self {
            store,
            manager,
            timeouts,
            cursor: 0,
        }
    }

    /// Offset of the last exit event this reaper has consumed.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Apply every exit event past the cursor. Returns how many changed a job.
    pub async fn process_pending(&mut self) -> usize {
        let events = self.manager.events().clone();
        let mut applied = 0;
        for event in events.read_from(self.cursor) {
            match apply_exit(self.store.as_ref(), &event).await {
                Ok(UpdateOutcome::Applied(_)) => {
                    tracing::info!(job_id = %event.job_id, offset = event.offset, "Reaper reconciled exit");
                    applied += 1;
                }
                Ok(UpdateOutcome::Skipped(_)) | Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    // Leave the cursor here so the event is retried.
                    tracing::error!(job_id = %event.job_id, error = %e, "Reaper could not apply exit");
                    break;
                }
            }
            self.cursor = event.offset;
        }
        events.commit(ExitConsumer::Reaper, self.cursor);
        applied
    }

    pub async fn sweep(&self) -> Vec<Uuid> {
        self.sweep_at(Utc::now()).await
    }

    /// Time out running jobs past `started_at + timeout + stop + grace`.
    /// Returns the jobs this sweep moved to `timeout`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let running = match self.store.list_by_status(JobStatus::Running).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Sweep could not list running jobs");
                return Vec::new();
            }
        };

        let mut reaped = Vec::new();
        for job in running {
            let lost_after = self.timeouts.lost_after(job.timeout_seconds);
            let Ok(lost_after) = chrono::Duration::from_std(lost_after) else {
                continue;
            };
            let started_at = job.started_at.unwrap_or(job.created_at);
            if now <= started_at + lost_after {
                continue;
            }

            let result = JobResult {
                exit_code: Some(-1),
                error_message: Some(format!(
                    "execution lost: no exit reported within {}s of start",
                    lost_after.num_seconds()
                )),
                duration_seconds: Some((now - started_at).num_milliseconds() as f64 / 1000.0),
                ..JobResult::default()
            };
            match finish_if(
                self.store.as_ref(),
                &job.id,
                &[JobStatus::Running],
                JobStatus::Timeout,
                result,
            )
            .await
            {
                Ok(UpdateOutcome::Applied(_)) => {
                    tracing::warn!(job_id = %job.id, started_at = %started_at, "Sweep reclaimed lost job");
                    self.manager.terminate(&job.id, TerminateReason::Lost);
                    reaped.push(job.id);
                }
                Ok(UpdateOutcome::Skipped(_)) => {}
                Err(e) => tracing::error!(job_id = %job.id, error = %e, "Sweep could not time out job"),
            }
        }
        reaped
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut changes = self.manager.events().subscribe();
        let mut sweep = tokio::time::interval(self.timeouts.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.timeouts.sweep_interval, "Recovery reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.process_pending().await;
                }
                _ = sweep.tick() => {
                    self.process_pending().await;
                    let reaped = self.sweep().await;
                    if !reaped.is_empty() {
                        tracing::warn!(count = reaped.len(), "Sweep reclaimed jobs");
                    }
                }
            }
        }
        tracing::info!("Recovery reaper stopped");
    }
}
