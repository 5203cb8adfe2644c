//! Error taxonomy surfaced by the run engine.
//!
//! Handle operations reject invalid requests synchronously with these errors
//! and leave no side effects behind. `ToolFailure` and `VerificationExhausted`
//! never escape a run: they are recorded as step failure reasons. Internal
//! plumbing uses `anyhow` and is converted to `RunFatal` at the run boundary.

use thiserror::Error;

use crate::core::types::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// The task left `queued` and can no longer be edited or deleted.
    #[error("task {uid} is {status}; only queued tasks can be changed")]
    InvalidState { uid: String, status: TaskStatus },

    #[error("task {0} not found")]
    TaskNotFound(String),

    /// An amendment arrived while nothing is running.
    #[error("no active run")]
    NoActiveRun,

    /// A step's external execution reported failure.
    #[error("step {step_id} tool failure: {message}")]
    ToolFailure { step_id: String, message: String },

    /// The step ran out of attempts or stopped improving.
    #[error("step {step_id} failed verification after {attempts} attempt(s): {reason}")]
    VerificationExhausted {
        step_id: String,
        attempts: u32,
        reason: String,
    },

    /// Unrecoverable error; the run is marked failed.
    #[error("run {run_id} failed: {message}")]
    RunFatal { run_id: String, message: String },
}

impl RunError {
    /// Build a `RunFatal` from an `anyhow` chain, keeping every context layer.
    pub fn fatal(run_id: &str, err: &anyhow::Error) -> Self {
        RunError::RunFatal {
            run_id: run_id.to_string(),
            message: format!("{err:#}"),
        }
    }
}
