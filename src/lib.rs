pub mod config;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use node::{JobRequest, Orchestrator};
