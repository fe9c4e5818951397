use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{EnvironmentError, StoreError};
use crate::scheduler::job::{Job, JobResult, JobStatus};
use crate::scheduler::queue::{PriorityQueues, QueueMessage};
use crate::scheduler::rate_limit::RateLimiter;
use crate::scheduler::store::{finish_if, update_if, JobStore, UpdateOutcome};
use crate::worker::{ExecutionManager, ExitConsumer, ExitEvent, UnitSpec};

/// Moves queued jobs onto execution units.
///
/// One loop polls the tiers in strict priority order, but only once a
/// concurrency slot is free, so a newly arrived high-priority job always wins
/// the next slot. Starts run as separate tasks; the slot travels with the
/// unit and is returned when the unit exits.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queues: Arc<PriorityQueues>,
    limiter: Arc<RateLimiter>,
    manager: ExecutionManager,
    slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    config: OrchestratorConfig,
}

/// Marks a job as being launched; cleared on drop.
struct InFlight {
    set: Arc<Mutex<HashSet<Uuid>>>,
    job_id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queues: Arc<PriorityQueues>,
        limiter: Arc<RateLimiter>,
        manager: ExecutionManager,
        config: OrchestratorConfig,
    ) -> Self {
        manager.events().register(ExitConsumer::Dispatcher);
        Self {
            store,
            queues,
            limiter,
            manager,
            slots: Arc::new(Semaphore::new(config.concurrency_limit)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    /// Run the dispatch loop and the completion loop until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            concurrency_limit = self.config.concurrency_limit,
            "Dispatcher started"
        );
        let completions = tokio::spawn(self.clone().run_completions(shutdown.clone()));

        loop {
            self.reconcile_dead_letters().await;

            let slot = tokio::select! {
                _ = shutdown.cancelled() => break,
                slot = self.slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            match self.queues.poll_strict() {
                Some(message) => self.handle_message(message, slot).await,
                None => {
                    drop(slot);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queues.wait_for_work(self.config.poll_interval) => {}
                    }
                }
            }
        }

        let _ = completions.await;
        tracing::info!("Dispatcher stopped");
    }

    /// Apply one delivery. The slot is consumed by a successful start and
    /// returned otherwise.
    pub async fn handle_message(&self, message: QueueMessage, slot: OwnedSemaphorePermit) {
        let job_id = message.job_id;
        let Some(guard) = self.claim(job_id) else {
            tracing::debug!(job_id = %job_id, "Launch already in progress, deferring duplicate");
            self.queues.defer(&message, self.config.defer_delay);
            return;
        };

        let job = match self.store.get(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Message references unknown job, discarding");
                self.queues.ack(&message);
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job store read failed");
                self.queues.nack(&message);
                return;
            }
        };

        if job.status != JobStatus::Queued {
            tracing::debug!(
                job_id = %job_id,
                status = %job.status,
                "Duplicate delivery, discarding"
            );
            self.queues.ack(&message);
            return;
        }

        if !self.limiter.admit(&job.submitter_id) {
            tracing::warn!(
                job_id = %job_id,
                submitter_id = %job.submitter_id,
                "Submitter over rate limit, deferring"
            );
            self.queues.defer(&message, self.config.defer_delay);
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.launch(job, message, slot).await;
            drop(guard);
        });
    }

    async fn launch(&self, job: Job, message: QueueMessage, slot: OwnedSemaphorePermit) {
        let job_id = job.id;
        let launch = match self.manager.start(UnitSpec::for_job(&job), slot).await {
            Ok(launch) => launch,
            Err(e) if !e.is_retryable() => {
                self.settle_redelivery(&job_id, &message).await;
                return;
            }
            Err(e) => {
                self.record_start_failure(&job, &message, e).await;
                return;
            }
        };

        let started = update_if(self.store.as_ref(), &job_id, &[JobStatus::Queued], |j| {
            j.advance(JobStatus::Running, Utc::now());
        })
        .await;

        match started {
            Ok(UpdateOutcome::Applied(job)) => {
                launch.confirm();
                self.queues.ack(&message);
                tracing::info!(
                    job_id = %job_id,
                    priority = %job.priority,
                    attempt = message.attempt,
                    "Job running"
                );
            }
            Ok(UpdateOutcome::Skipped(current)) => {
                tracing::info!(
                    job_id = %job_id,
                    status = %current.status,
                    "Job left the queue during start, stopping unit"
                );
                launch.abandon();
                self.queues.ack(&message);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not record running state");
                launch.abandon();
                self.queues.nack(&message);
            }
        }
    }

    /// A unit still exists for this job, typically one being torn down after
    /// an abandoned launch. Drop the delivery only if the job has moved on;
    /// a job still `queued` must keep its message.
    async fn settle_redelivery(&self, job_id: &Uuid, message: &QueueMessage) {
        match self.store.get(job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Queued => {
                tracing::debug!(job_id = %job_id, "Previous unit still active, deferring delivery");
                self.queues.defer(message, self.config.defer_delay);
            }
            Ok(_) => {
                tracing::debug!(job_id = %job_id, "Job already has a unit, discarding delivery");
                self.queues.ack(message);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job store read failed");
                self.queues.nack(message);
            }
        }
    }

    async fn record_start_failure(
        &self,
        job: &Job,
        message: &QueueMessage,
        error: EnvironmentError,
    ) {
        let job_id = job.id;
        let counted = update_if(self.store.as_ref(), &job_id, &[JobStatus::Queued], |j| {
            j.delivery_attempts += 1;
        })
        .await;

        let attempts = match counted {
            Ok(UpdateOutcome::Applied(job)) => job.delivery_attempts,
            Ok(UpdateOutcome::Skipped(_)) => {
                self.queues.ack(message);
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not record start failure");
                self.queues.nack(message);
                return;
            }
        };

        if attempts < self.config.queue.max_delivery_attempts {
            let base = self.config.start_backoff(attempts);
            let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
            let backoff = base + Duration::from_millis(jitter_ms);
            tracing::warn!(
                job_id = %job_id,
                attempt = attempts,
                backoff = ?backoff,
                error = %error,
                "Start failed, will retry"
            );
            self.queues.nack_after(message, backoff);
            return;
        }

        let reason = format!("dispatch failed after {} attempts: {}", attempts, error);
        self.queues.dead_letter(message, reason.clone());
        match finish_if(
            self.store.as_ref(),
            &job_id,
            &[JobStatus::Queued],
            JobStatus::Failed,
            JobResult::error(reason),
        )
        .await
        {
            Ok(outcome) if outcome.is_applied() => {
                tracing::error!(job_id = %job_id, attempts, "Job failed, start attempts exhausted");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Could not mark job failed"),
        }
    }

    /// Mark jobs whose messages were dead-lettered by the queues as failed.
    async fn reconcile_dead_letters(&self) {
        for letter in self.queues.dead_letters().drain_unreconciled() {
            let result = JobResult::error(format!("dead-lettered: {}", letter.reason));
            match finish_if(
                self.store.as_ref(),
                &letter.job_id,
                &[JobStatus::Queued],
                JobStatus::Failed,
                result,
            )
            .await
            {
                Ok(UpdateOutcome::Applied(_)) => {
                    tracing::error!(job_id = %letter.job_id, reason = %letter.reason, "Dead-lettered job marked failed");
                }
                Ok(UpdateOutcome::Skipped(_)) | Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    tracing::error!(job_id = %letter.job_id, error = %e, "Could not reconcile dead letter");
                }
            }
        }
    }

    /// Follow the exit log and write each exit's terminal state.
    async fn run_completions(self, shutdown: CancellationToken) {
        let events = self.manager.events().clone();
        let mut changes = events.subscribe();
        let mut cursor = 0;

        loop {
            for event in events.read_from(cursor) {
                cursor = event.offset;
                if let Err(e) = apply_exit(self.store.as_ref(), &event).await {
                    // The reaper keeps its own cursor and retries this one.
                    tracing::error!(job_id = %event.job_id, error = %e, "Could not apply exit");
                }
            }
            events.commit(ExitConsumer::Dispatcher, cursor);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn claim(&self, job_id: Uuid) -> Option<InFlight> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id);
        inserted.then(|| InFlight {
            set: self.in_flight.clone(),
            job_id,
        })
    }
}

/// Write the terminal state an exit maps to, guarded on the job still running.
/// Losing the race to another writer is not an error.
pub async fn apply_exit(
    store: &dyn JobStore,
    event: &ExitEvent,
) -> Result<UpdateOutcome, StoreError> {
    let (status, result) = event.resolution();
    let outcome = finish_if(store, &event.job_id, &[JobStatus::Running], status, result).await?;
    match &outcome {
        UpdateOutcome::Applied(job) => tracing::info!(
            job_id = %event.job_id,
            status = %job.status,
            offset = event.offset,
            "Job finished"
        ),
        UpdateOutcome::Skipped(job) => tracing::debug!(
            job_id = %event.job_id,
            status = %job.status,
            offset = event.offset,
            "Exit already reconciled"
        ),
    }
    Ok(outcome)
}
