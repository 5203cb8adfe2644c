//! Side-effecting helpers: configuration, the trace log, per-run artifacts
//! and collaborator process execution.

pub mod artifacts;
pub mod config;
pub mod executor;
pub mod process;
pub mod prompt;
pub mod sources_store;
pub mod trace;
