use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::error::EnvironmentError;
use crate::worker::environment::{EnvironmentProvider, ExecutionUnit, UnitSpec};
use crate::worker::events::{ExitEventLog, ExitOutcome};
use crate::worker::logs::{LogHub, LogStream, LogSubscription};

/// Why a running unit is being stopped from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The submitter cancelled the job
    Cancel,
    /// The recovery sweep gave up on the job
    Lost,
}

#[derive(Debug, Default)]
struct UnitControl {
    token: CancellationToken,
    reason: Mutex<Option<TerminateReason>>,
}

impl UnitControl {
    fn request(&self, reason: TerminateReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    fn reason(&self) -> Option<TerminateReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A provisioned unit waiting for the caller to record it as running.
///
/// The run timer does not start until [`Launch::confirm`]. Dropping the launch
/// without confirming it has the same effect as [`Launch::abandon`].
#[derive(Debug)]
pub struct Launch {
    job_id: Uuid,
    unit_id: String,
    decision: oneshot::Sender<bool>,
}

impl Launch {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Start the run timer and watch the unit until it exits.
    pub fn confirm(self) {
        let _ = self.decision.send(true);
    }

    /// Tear the unit down without running it to completion.
    pub fn abandon(self) {
        let _ = self.decision.send(false);
    }
}

/// Owns the lifecycle of every execution unit on this orchestrator.
///
/// At most one unit exists per job at a time: `start` reserves the job id
/// before provisioning and the reservation is only released after the unit
/// has been removed. Each unit holds one concurrency permit for its whole
/// life, and every exit is appended to the [`ExitEventLog`].
#[derive(Clone)]
pub struct ExecutionManager {
    provider: Arc<dyn EnvironmentProvider>,
    timeouts: TimeoutConfig,
    active: Arc<Mutex<HashMap<Uuid, Arc<UnitControl>>>>,
    events: Arc<ExitEventLog>,
    logs: Arc<LogHub>,
}

impl ExecutionManager {
    pub fn new(provider: Arc<dyn EnvironmentProvider>, timeouts: TimeoutConfig) -> Self {
        Self {
            provider,
            timeouts,
            active: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(ExitEventLog::new()),
            logs: Arc::new(LogHub::new()),
        }
    }

    pub fn events(&self) -> &Arc<ExitEventLog> {
        &self.events
    }

    /// Provision and start a unit for `spec.job_id`.
    ///
    /// Fails with `AlreadyActive` if the job already has a unit (or one is
    /// being provisioned), and with `StartTimeout` if the provider does not
    /// report ready within the start timeout. On any failure nothing is left
    /// running and the permit is returned.
    pub async fn start(
        &self,
        spec: UnitSpec,
        permit: OwnedSemaphorePermit,
    ) -> Result<Launch, EnvironmentError> {
        let job_id = spec.job_id;
        let control = Arc::new(UnitControl::default());
        {
            let mut active = self.lock_active();
            if active.contains_key(&job_id) {
                return Err(EnvironmentError::AlreadyActive(job_id));
            }
            active.insert(job_id, control.clone());
        }
        self.logs.open(job_id);

        tracing::info!(job_id = %job_id, provider = self.provider.name(), "Provisioning execution unit");
        let provisioned = tokio::time::timeout(
            self.timeouts.start,
            self.provider.provision(&spec, self.logs.sink(job_id)),
        )
        .await;

        let unit = match provisioned {
            Ok(Ok(unit)) => unit,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Provisioning failed");
                self.release(&job_id).await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    timeout = ?self.timeouts.start,
                    "Unit not ready in time, removing"
                );
                self.release(&job_id).await;
                return Err(EnvironmentError::StartTimeout(self.timeouts.start));
            }
        };

        let unit_id = unit.id().to_string();
        self.logs
            .append(job_id, LogStream::System, format!("unit {} ready", unit_id));
        let (decision, decided) = oneshot::channel();
        let monitor = self.clone();
        let run_timeout = Duration::from_secs(spec.timeout_seconds);
        tokio::spawn(async move {
            monitor
                .monitor(job_id, unit, control, decided, run_timeout, permit)
                .await;
        });

        Ok(Launch {
            job_id,
            unit_id,
            decision,
        })
    }

    /// Stop the unit for `job_id`, if there is one. Returns false when the
    /// job has no unit on this manager.
    pub fn terminate(&self, job_id: &Uuid, reason: TerminateReason) -> bool {
        match self.lock_active().get(job_id) {
            Some(control) => {
                tracing::info!(job_id = %job_id, reason = ?reason, "Terminating execution unit");
                control.request(reason);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, job_id: &Uuid) -> bool {
        self.lock_active().contains_key(job_id)
    }

    /// Jobs that currently hold a unit or a reservation.
    pub fn active(&self) -> Vec<Uuid> {
        self.lock_active().keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    pub fn attach_logs(&self, job_id: &Uuid) -> Option<LogSubscription> {
        self.logs.attach(job_id)
    }

    async fn monitor(
        &self,
        job_id: Uuid,
        unit: Arc<dyn ExecutionUnit>,
        control: Arc<UnitControl>,
        decided: oneshot::Receiver<bool>,
        run_timeout: Duration,
        permit: OwnedSemaphorePermit,
    ) {
        if !matches!(decided.await, Ok(true)) {
            tracing::info!(job_id = %job_id, unit_id = unit.id(), "Launch abandoned, stopping unit");
            self.stop_unit(unit.as_ref()).await;
            self.release(&job_id).await;
            drop(permit);
            return;
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            exit = unit.wait() => match exit {
                Ok(exit) => ExitOutcome::Exited {
                    exit_code: exit.exit_code,
                    artifact_ref: exit.artifact_ref,
                    logs_ref: exit.logs_ref,
                    error: exit.error,
                },
                Err(e) => ExitOutcome::Crashed { reason: e.to_string() },
            },
            _ = tokio::time::sleep(run_timeout) => {
                tracing::warn!(job_id = %job_id, timeout_secs = run_timeout.as_secs(), "Run timeout reached");
                self.logs.append(job_id, LogStream::System, "run timeout reached, stopping unit");
                self.stop_unit(unit.as_ref()).await;
                ExitOutcome::TimedOut { after_secs: run_timeout.as_secs() }
            }
            _ = control.token.cancelled() => {
                self.logs.append(job_id, LogStream::System, "termination requested, stopping unit");
                self.stop_unit(unit.as_ref()).await;
                match control.reason() {
                    Some(TerminateReason::Lost) => ExitOutcome::Crashed {
                        reason: "terminated by recovery sweep".to_string(),
                    },
                    _ => ExitOutcome::Cancelled,
                }
            }
        };

        // Exit is visible in the log before the reservation disappears.
        let duration = started.elapsed();
        self.provider.force_remove(&job_id).await;
        let event = self
            .events
            .append(job_id, unit.id().to_string(), outcome, duration);
        self.drop_reservation(&job_id);
        tracing::info!(
            job_id = %job_id,
            unit_id = unit.id(),
            offset = event.offset,
            duration_secs = duration.as_secs_f64(),
            outcome = ?event.outcome,
            "Execution unit exited"
        );
        drop(permit);
    }

    /// Graceful stop, escalating to a kill after the stop timeout.
    async fn stop_unit(&self, unit: &dyn ExecutionUnit) {
        if let Err(e) = unit.signal_stop().await {
            tracing::debug!(unit_id = unit.id(), error = %e, "Stop signal failed");
        }
        match tokio::time::timeout(self.timeouts.stop, unit.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!(unit_id = unit.id(), error = %e, "Wait after stop failed, killing");
                let _ = unit.kill().await;
            }
            Err(_) => {
                tracing::warn!(unit_id = unit.id(), "Unit ignored stop signal, killing");
                if let Err(e) = unit.kill().await {
                    tracing::error!(unit_id = unit.id(), error = %e, "Kill failed");
                }
            }
        }
    }

    /// Remove the unit's resources, then drop the reservation.
    async fn release(&self, job_id: &Uuid) {
        self.provider.force_remove(job_id).await;
        self.drop_reservation(job_id);
    }

    fn drop_reservation(&self, job_id: &Uuid) {
        self.lock_active().remove(job_id);
        self.logs.close(job_id);
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<UnitControl>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("provider", &self.provider.name())
            .field("active", &self.active_count())
            .finish()
    }
}
