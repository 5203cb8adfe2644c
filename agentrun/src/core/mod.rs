//! Deterministic, pure logic shared by the run engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod plan;
pub mod sources;
pub mod types;
pub mod verify;
