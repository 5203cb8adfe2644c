//! Stable exit codes for agentrun CLI commands.

/// Command succeeded; for `run`, the task finished `done`.
pub const OK: i32 = 0;
/// Invalid config, arguments or run id, or any other error.
pub const INVALID: i32 = 1;
/// `agentrun run` finished with the task `failed`.
pub const FAILED: i32 = 2;
