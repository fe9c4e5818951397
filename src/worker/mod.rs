//! Execution environments for agent jobs.
//!
//! # Components
//!
//! - [`ExecutionManager`]: provisions units, enforces start/run/stop timers,
//!   and reports every exit
//! - [`EnvironmentProvider`] / [`ExecutionUnit`]: the seam to whatever actually
//!   runs the agent
//! - [`DockerProvider`]: sandboxed Docker containers
//! - [`ExitEventLog`]: append-only record of exits
//! - [`LogHub`]: live agent output with a short backlog

pub mod docker;
pub mod environment;
pub mod events;
pub mod executor;
pub mod logs;

pub use docker::DockerProvider;
pub use environment::{EnvironmentProvider, ExecutionUnit, UnitExit, UnitSpec};
pub use events::{ExitConsumer, ExitEvent, ExitEventLog, ExitOutcome};
pub use executor::{ExecutionManager, Launch, TerminateReason};
pub use logs::{LogHub, LogSink, LogSubscription};
