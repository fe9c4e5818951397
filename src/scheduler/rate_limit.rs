use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::config::RateLimitConfig;

/// Per-submitter admission control over fixed, non-sliding windows.
///
/// Each `(submitter, window_start)` pair holds a counter that `admit`
/// increments before comparing against the ceiling. Rejected attempts keep
/// their increment, so retry storms burn their own budget. Bursts straddling
/// a window boundary can admit up to twice the ceiling in a short span.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    counters: Mutex<HashMap<(String, i64), u32>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one job for `submitter_id` in the current window.
    pub fn admit(&self, submitter_id: &str) -> bool {
        self.admit_at(submitter_id, Utc::now())
    }

    pub fn admit_at(&self, submitter_id: &str, now: DateTime<Utc>) -> bool {
        let window = self.window_start(now);
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        // Stale windows expire as soon as a newer one is touched.
        counters.retain(|(_, start), _| *start >= window);

        let count = counters
            .entry((submitter_id.to_string(), window))
            .or_insert(0);
        *count = count.saturating_add(1);

        let admitted = *count <= self.config.max_per_window;
        if !admitted {
            tracing::debug!(
                submitter_id,
                count = *count,
                ceiling = self.config.max_per_window,
                "Rate limit exceeded"
            );
        }
        admitted
    }

    /// Attempts recorded for `submitter_id` in the window containing `now`.
    pub fn count_at(&self, submitter_id: &str, now: DateTime<Utc>) -> u32 {
        let window = self.window_start(now);
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(submitter_id.to_string(), window))
            .copied()
            .unwrap_or(0)
    }

    /// Number of live counter records.
    pub fn tracked_windows(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        let secs = self.config.window.as_secs().max(1) as i64;
        now.timestamp().div_euclid(secs) * secs
    }
}
