//! I/O adapters used by the engine.

pub mod config;
pub mod executor;
pub mod model;
pub mod probe;
pub mod process;
pub mod prompt;
pub mod self_update;
pub mod step_log;
pub mod store;
