//! Shared application state for the API server.

use agentrun::coordinator::RunnerHandle;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Thread-safe entry point into the run loop.
    pub handle: RunnerHandle,
}

impl AppState {
    pub fn new(handle: RunnerHandle) -> Self {
        Self { handle }
    }
}
