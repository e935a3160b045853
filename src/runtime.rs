//! Runtime glue: configuration, errors, injected policies, the event sink,
//! progress tracking, telemetry and runner orchestration.

pub mod config;
pub mod error;
pub mod fatal;
pub mod policy;
pub mod progress;
pub mod runner;
pub mod sink;
pub mod telemetry;
