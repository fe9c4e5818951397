use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Tiers in strict dispatch order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    /// Edges of the lifecycle DAG. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                next,
                JobStatus::Running | JobStatus::Cancelled | JobStatus::Failed
            ),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Opaque task payload handed to the agent: a URL plus string parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Target {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Outcome attached to a job once it reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub artifact_ref: Option<String>,
    pub logs_ref: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl JobResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub submitter_id: String,
    pub priority: Priority,
    pub target: Target,
    pub status: JobStatus,
    pub timeout_seconds: u64,
    pub delivery_attempts: u32,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every committed write
    pub version: u64,
}

impl Job {
    pub fn new(
        submitter_id: impl Into<String>,
        target: Target,
        priority: Priority,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter_id: submitter_id.into(),
            priority,
            target,
            status: JobStatus::Queued,
            timeout_seconds,
            delivery_attempts: 0,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    /// Move along the lifecycle DAG, stamping timestamps at most once.
    ///
    /// Returns false (and leaves the job untouched) for an edge the DAG does
    /// not allow. Timestamps never go backwards: a clock that reads earlier
    /// than a previous stamp is clamped to that stamp.
    pub fn advance(&mut self, next: JobStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(at.max(self.created_at));
        }
        if next.is_terminal() && self.completed_at.is_none() {
            let floor = self.started_at.unwrap_or(self.created_at);
            self.completed_at = Some(at.max(floor));
        }

        self.status = next;
        true
    }

    /// Finish the job with a result. Only valid from a state that may reach `status`.
    pub fn finish(&mut self, status: JobStatus, result: JobResult, at: DateTime<Utc>) -> bool {
        if !status.is_terminal() || !self.advance(status, at) {
            return false;
        }
        self.result = Some(result);
        true
    }
}
