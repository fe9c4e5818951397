//! Live agent log streams.
//!
//! Each active job gets a bounded backlog plus a broadcast channel so a
//! subscriber that attaches mid-run first sees recent history, then follows
//! new lines until the unit exits. Delivery is best effort: a subscriber that
//! falls too far behind skips lines.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lines retained per job for late subscribers.
pub const LOG_BACKLOG_LINES: usize = 256;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lifecycle notes from the orchestrator itself
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

#[derive(Debug)]
struct Stream {
    backlog: VecDeque<LogLine>,
    tx: broadcast::Sender<LogLine>,
}

/// Registry of per-job log streams.
#[derive(Debug, Default)]
pub struct LogHub {
    streams: Mutex<HashMap<Uuid, Stream>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the stream for a job, replacing any stale one.
    pub fn open(&self, job_id: Uuid) {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.lock().insert(
            job_id,
            Stream {
                backlog: VecDeque::new(),
                tx,
            },
        );
    }

    /// Record one line. Lines for a job without an open stream are dropped.
    pub fn append(&self, job_id: Uuid, stream: LogStream, line: impl Into<String>) {
        let entry = LogLine {
            job_id,
            timestamp: Utc::now(),
            stream,
            line: line.into(),
        };
        let mut streams = self.lock();
        let Some(stream) = streams.get_mut(&job_id) else {
            return;
        };
        if stream.backlog.len() == LOG_BACKLOG_LINES {
            stream.backlog.pop_front();
        }
        stream.backlog.push_back(entry.clone());
        // No receivers is fine; the backlog keeps the line.
        let _ = stream.tx.send(entry);
    }

    /// Attach to a job's stream. `None` when the job has no live unit.
    pub fn attach(&self, job_id: &Uuid) -> Option<LogSubscription> {
        let streams = self.lock();
        let stream = streams.get(job_id)?;
        Some(LogSubscription {
            backlog: stream.backlog.clone(),
            rx: stream.tx.subscribe(),
        })
    }

    /// End the stream. Attached subscribers drain and then see `None`.
    pub fn close(&self, job_id: &Uuid) {
        self.lock().remove(job_id);
    }

    /// Write handle bound to one job, handed to environment providers.
    pub fn sink(self: &Arc<Self>, job_id: Uuid) -> LogSink {
        LogSink {
            hub: self.clone(),
            job_id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Stream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write end of a single job's stream.
#[derive(Debug, Clone)]
pub struct LogSink {
    hub: Arc<LogHub>,
    job_id: Uuid,
}

impl LogSink {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn stdout(&self, line: impl Into<String>) {
        self.hub.append(self.job_id, LogStream::Stdout, line);
    }

    pub fn stderr(&self, line: impl Into<String>) {
        self.hub.append(self.job_id, LogStream::Stderr, line);
    }

    pub fn system(&self, line: impl Into<String>) {
        self.hub.append(self.job_id, LogStream::System, line);
    }
}

/// Read end returned by [`LogHub::attach`]. Dropping it detaches.
#[derive(Debug)]
pub struct LogSubscription {
    backlog: VecDeque<LogLine>,
    rx: broadcast::Receiver<LogLine>,
}

impl LogSubscription {
    /// Next line, or `None` once the unit has exited and everything was read.
    pub async fn next(&mut self) -> Option<LogLine> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(line);
        }
        loop {
            match self.rx.recv().await {
                Ok(line) => return Some(line),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Log subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
