//! Deterministic, pure logic shared by the dispatcher and supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod agents;
pub mod labels;
pub mod policy;
pub mod supervision;
pub mod types;
