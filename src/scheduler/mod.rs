//! Job state, admission, and dispatch.
//!
//! - [`JobStore`]: system of record with conditional writes
//! - [`RateLimiter`]: per-submitter fixed-window admission
//! - [`PriorityQueues`]: three tiers with at-least-once delivery
//! - [`Dispatcher`]: strict-priority polling onto execution units
//! - [`RecoveryReaper`]: reconciles exits and sweeps lost jobs

pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod rate_limit;
pub mod reaper;
pub mod store;

pub use dispatcher::Dispatcher;
pub use job::{Job, JobResult, JobStatus, Priority, Target};
pub use queue::{DeadLetter, DeadLetterChannel, DeliveryState, PriorityQueues, QueueMessage};
pub use rate_limit::RateLimiter;
pub use reaper::RecoveryReaper;
pub use store::{finish_if, update_if, JobStore, MemoryJobStore, UpdateOutcome};
