//! Run orchestration engine for goal-driven agent runs.
//!
//! A submitted goal becomes a task in a FIFO queue. One run at a time takes
//! the next task, asks a planner for an ordered list of steps, and dispatches
//! each step to the agent registered for its kind. A judge checks every
//! attempt; rejected attempts are retried with feedback until the verifier
//! accepts or gives up.
//!
//! - **[`core`]**: Pure logic (plan state machine, retry policy, URL
//!   normalization, source merging). No I/O.
//! - **[`io`]**: Side effects (config, trace log, run artifacts, external
//!   commands, prompt rendering).
//!
//! [`coordinator`] owns the run loop; [`dispatch`] drives a single step.
//! Transports talk to the loop only through a
//! [`RunnerHandle`](coordinator::RunnerHandle).

pub mod agents;
pub mod coordinator;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod queue;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
