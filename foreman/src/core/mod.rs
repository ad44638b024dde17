//! Deterministic, pure logic shared by the foreman roles.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests; the
//! current time is always passed in by the caller.

pub mod envelope;
pub mod heartbeat;
pub mod ids;
pub mod transition;
pub mod types;
pub mod workflow;
