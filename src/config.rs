use std::path::PathBuf;
use std::time::Duration;

/// Configuration for Docker-based execution environments.
///
/// Every job runs in its own sandboxed container that is removed on exit.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Agent image started for each job
    pub image: String,
    /// Docker network to attach to. `None` disables networking entirely.
    pub network: Option<String>,
    /// Memory limit (e.g., "512m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Host directory under which each job gets an `/output` mount
    pub output_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "ephemeral-agent:latest".to_string(),
            network: Some("ephemeral-agent-network".to_string()),
            memory_limit: Some("512m".to_string()),
            cpu_limit: Some("0.5".to_string()),
            output_dir: PathBuf::from("/tmp/ephemeral-agent"),
        }
    }
}

/// Per-submitter admission limits.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Jobs admitted per submitter per window
    pub max_per_window: u32,
    /// Fixed window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Delivery policy shared by the three priority tiers.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Failed deliveries before a message is dead-lettered
    pub max_delivery_attempts: u32,
    /// How long a delivered message stays hidden waiting for an ack
    pub visibility_timeout: Duration,
    /// Window in which re-enqueuing the same job is a no-op
    pub dedup_window: Duration,
    /// Maximum number of live messages per tier
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 3,
            visibility_timeout: Duration::from_secs(60),
            dedup_window: Duration::from_secs(300),
            capacity: 10_000,
        }
    }
}

/// Timers enforced on execution environments and by the recovery sweep.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Bound on provisioning a unit until it is ready
    pub start: Duration,
    /// Grace between a termination signal and a forced kill
    pub stop: Duration,
    /// Extra slack before the sweep declares a running job lost
    pub sweep_grace: Duration,
    /// How often the recovery sweep runs
    pub sweep_interval: Duration,
    pub default_job_timeout_secs: u64,
    /// Floor for a zero or missing bound; not a minimum run length
    pub min_job_timeout_secs: u64,
    pub max_job_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(30),
            stop: Duration::from_secs(10),
            sweep_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            default_job_timeout_secs: 600,
            min_job_timeout_secs: 1,
            max_job_timeout_secs: 3600,
        }
    }
}

impl TimeoutConfig {
    /// Clamp a caller-supplied run timeout into the configured bounds.
    pub fn clamp_job_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_job_timeout_secs)
            .clamp(self.min_job_timeout_secs, self.max_job_timeout_secs)
    }

    /// Time past `started_at` after which a silent running job counts as lost.
    pub fn lost_after(&self, timeout_seconds: u64) -> Duration {
        Duration::from_secs(timeout_seconds) + self.stop + self.sweep_grace
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global cap on concurrently running execution environments
    pub concurrency_limit: usize,
    /// Idle wait between dispatch cycles when every tier is empty
    pub poll_interval: Duration,
    /// Delay before a rate-limited message becomes visible again
    pub defer_delay: Duration,
    /// First backoff after a failed start; doubles on each further failure
    pub start_retry_backoff: Duration,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub timeouts: TimeoutConfig,
    pub sandbox: SandboxConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 8,
            poll_interval: Duration::from_millis(250),
            defer_delay: Duration::from_secs(1),
            start_retry_backoff: Duration::from_secs(2),
            queue: QueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            timeouts: TimeoutConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn with_rate_limit(mut self, max_per_window: u32, window: Duration) -> Self {
        self.rate_limit = RateLimitConfig {
            max_per_window,
            window,
        };
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Backoff before redelivering a job whose start failed `attempts` times.
    pub fn start_backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(5);
        self.start_retry_backoff * 2u32.pow(exponent)
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}
