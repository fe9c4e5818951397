//! Durable record of execution-unit exits.
//!
//! The execution manager appends one event per unit that stops, for any
//! reason. The dispatcher consumes exits as they happen; the recovery reaper
//! keeps its own cursor into the same log so an exit that no live consumer
//! applied is still reconciled later.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::scheduler::{JobResult, JobStatus};

/// Why a unit stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// The agent process finished on its own
    Exited {
        exit_code: i32,
        artifact_ref: Option<String>,
        logs_ref: Option<String>,
        error: Option<String>,
    },
    /// The run timer fired and the unit was terminated
    TimedOut { after_secs: u64 },
    /// A cancellation request terminated the unit
    Cancelled,
    /// The unit vanished or could not be observed
    Crashed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitEvent {
    /// Position in the log, starting at 1
    pub offset: u64,
    pub job_id: Uuid,
    pub unit_id: String,
    pub outcome: ExitOutcome,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub observed_at: DateTime<Utc>,
}

impl ExitEvent {
    /// Terminal status and result this exit maps to.
    pub fn resolution(&self) -> (JobStatus, JobResult) {
        let duration_seconds = Some(self.duration.as_secs_f64());
        match &self.outcome {
            ExitOutcome::Exited {
                exit_code,
                artifact_ref,
                logs_ref,
                error,
            } => {
                let status = if *exit_code == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                let error_message = match (status, error) {
                    (JobStatus::Completed, _) => None,
                    (_, Some(e)) => Some(e.clone()),
                    (_, None) => Some(format!("agent exited with code {}", exit_code)),
                };
                (
                    status,
                    JobResult {
                        artifact_ref: artifact_ref.clone(),
                        logs_ref: logs_ref.clone(),
                        exit_code: Some(*exit_code),
                        error_message,
                        duration_seconds,
                    },
                )
            }
            ExitOutcome::TimedOut { after_secs } => (
                JobStatus::Timeout,
                JobResult {
                    exit_code: Some(-1),
                    error_message: Some(format!(
                        "execution exceeded timeout of {}s",
                        after_secs
                    )),
                    duration_seconds,
                    ..JobResult::default()
                },
            ),
            ExitOutcome::Cancelled => (
                JobStatus::Cancelled,
                JobResult {
                    error_message: Some("cancelled by request".to_string()),
                    duration_seconds,
                    ..JobResult::default()
                },
            ),
            ExitOutcome::Crashed { reason } => (
                JobStatus::Failed,
                JobResult {
                    error_message: Some(format!("execution unit crashed: {}", reason)),
                    duration_seconds,
                    ..JobResult::default()
                },
            ),
        }
    }
}

/// Consumer of the exit log that reports how far it has applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitConsumer {
    Dispatcher,
    Reaper,
}

#[derive(Debug, Default)]
struct LogInner {
    events: VecDeque<ExitEvent>,
    /// Offset of the newest event dropped by compaction
    log_offset: u64,
    next_offset: u64,
    cursors: HashMap<ExitConsumer, u64>,
}

/// Append-only log of exit events with change notification.
///
/// Offsets are absolute and survive compaction. Once every registered
/// consumer has committed past an event it is dropped from memory.
#[derive(Debug)]
pub struct ExitEventLog {
    inner: Mutex<LogInner>,
    head_tx: watch::Sender<u64>,
}

impl Default for ExitEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitEventLog {
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(LogInner {
                next_offset: 1,
                ..LogInner::default()
            }),
            head_tx,
        }
    }

    /// Append an event and return it with its offset.
    pub fn append(
        &self,
        job_id: Uuid,
        unit_id: String,
        outcome: ExitOutcome,
        duration: Duration,
    ) -> ExitEvent {
        let event = {
            let mut inner = self.lock();
            let event = ExitEvent {
                offset: inner.next_offset,
                job_id,
                unit_id,
                outcome,
                duration,
                observed_at: Utc::now(),
            };
            inner.next_offset += 1;
            inner.events.push_back(event.clone());
            event
        };
        self.head_tx.send_replace(event.offset);
        event
    }

    /// Retained events with an offset strictly greater than `after`.
    pub fn read_from(&self, after: u64) -> Vec<ExitEvent> {
        let inner = self.lock();
        let skip = after.saturating_sub(inner.log_offset);
        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        inner.events.iter().skip(skip).cloned().collect()
    }

    /// Offset of the newest event, or 0 when empty.
    pub fn head(&self) -> u64 {
        *self.head_tx.borrow()
    }

    /// Offset of the newest event dropped by compaction.
    pub fn log_offset(&self) -> u64 {
        self.lock().log_offset
    }

    /// Whether a retained event reports an exit for `job_id`.
    pub fn contains_job(&self, job_id: &Uuid) -> bool {
        self.lock().events.iter().any(|e| e.job_id == *job_id)
    }

    /// Events still held in memory.
    pub fn retained(&self) -> usize {
        self.lock().events.len()
    }

    /// Receiver that changes whenever an event is appended.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }

    /// Start tracking `consumer`. Nothing past its cursor is compacted away.
    pub fn register(&self, consumer: ExitConsumer) {
        let mut inner = self.lock();
        let start = inner.log_offset;
        inner.cursors.entry(consumer).or_insert(start);
    }

    /// Record that `consumer` has applied everything up to `offset`, then
    /// drop the prefix every consumer has applied.
    pub fn commit(&self, consumer: ExitConsumer, offset: u64) {
        let through = {
            let mut inner = self.lock();
            let cursor = inner.cursors.entry(consumer).or_insert(0);
            *cursor = (*cursor).max(offset);
            inner.cursors.values().copied().min().unwrap_or(0)
        };
        self.compact_through(through);
    }

    /// Drop events up to and including `offset`. Returns how many were dropped.
    pub fn compact_through(&self, offset: u64) -> usize {
        let mut inner = self.lock();
        let mut dropped = 0;
        while inner.events.front().is_some_and(|e| e.offset <= offset) {
            if let Some(event) = inner.events.pop_front() {
                inner.log_offset = event.offset;
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(log_offset = inner.log_offset, dropped, "Compacted exit log");
        }
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ExitOutcome {
        ExitOutcome::Exited {
            exit_code: code,
            artifact_ref: Some("/tmp/out/screenshot.png".to_string()),
            logs_ref: None,
            error: None,
        }
    }

    #[test]
    fn offsets_are_sequential_and_readable_from_cursor() {
        let log = ExitEventLog::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        log.append(a, "unit-a".into(), exited(0), Duration::from_secs(1));
        log.append(b, "unit-b".into(), ExitOutcome::Cancelled, Duration::ZERO);

        assert_eq!(log.head(), 2);
        let tail = log.read_from(1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].job_id, b);
        assert!(log.read_from(2).is_empty());
        assert!(log.read_from(100).is_empty());
    }

    #[test]
    fn zero_exit_completes_with_artifact() {
        let log = ExitEventLog::new();
        let event = log.append(Uuid::new_v4(), "u".into(), exited(0), Duration::from_secs(3));
        let (status, result) = event.resolution();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.artifact_ref.is_some());
        assert!(result.error_message.is_none());
    }

    #[test]
    fn nonzero_exit_fails_with_code_in_message() {
        let log = ExitEventLog::new();
        let event = log.append(Uuid::new_v4(), "u".into(), exited(2), Duration::ZERO);
        let (status, result) = event.resolution();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            result.error_message.as_deref(),
            Some("agent exited with code 2")
        );
    }

    #[test]
    fn timeout_maps_to_timeout_with_minus_one() {
        let log = ExitEventLog::new();
        let event = log.append(
            Uuid::new_v4(),
            "u".into(),
            ExitOutcome::TimedOut { after_secs: 5 },
            Duration::from_secs(5),
        );
        let (status, result) = event.resolution();
        assert_eq!(status, JobStatus::Timeout);
        assert_eq!(result.exit_code, Some(-1));
        assert_eq!(
            result.error_message.as_deref(),
            Some("execution exceeded timeout of 5s")
        );
    }

    #[test]
    fn compaction_waits_for_every_consumer() {
        let log = ExitEventLog::new();
        log.register(ExitConsumer::Dispatcher);
        log.register(ExitConsumer::Reaper);
        for _ in 0..3 {
            log.append(Uuid::new_v4(), "u".into(), ExitOutcome::Cancelled, Duration::ZERO);
        }

        log.commit(ExitConsumer::Dispatcher, 3);
        assert_eq!(log.retained(), 3);
        assert_eq!(log.log_offset(), 0);

        log.commit(ExitConsumer::Reaper, 2);
        assert_eq!(log.retained(), 1);
        assert_eq!(log.log_offset(), 2);

        // Offsets stay absolute after the prefix is gone.
        let tail = log.read_from(2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].offset, 3);
        assert_eq!(log.read_from(0)[0].offset, 3);
        let next = log.append(Uuid::new_v4(), "u".into(), ExitOutcome::Cancelled, Duration::ZERO);
        assert_eq!(next.offset, 4);
        assert_eq!(log.head(), 4);
    }

    #[test]
    fn stale_commit_does_not_move_cursor_back() {
        let log = ExitEventLog::new();
        log.register(ExitConsumer::Reaper);
        log.append(Uuid::new_v4(), "u".into(), ExitOutcome::Cancelled, Duration::ZERO);
        log.append(Uuid::new_v4(), "u".into(), ExitOutcome::Cancelled, Duration::ZERO);

        log.commit(ExitConsumer::Reaper, 2);
        log.commit(ExitConsumer::Reaper, 1);
        assert_eq!(log.retained(), 0);
        assert_eq!(log.log_offset(), 2);
        assert!(log.read_from(1).is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_appends() {
        let log = ExitEventLog::new();
        let mut rx = log.subscribe();
        log.append(Uuid::new_v4(), "u".into(), ExitOutcome::Cancelled, Duration::ZERO);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
