//! Deterministic, pure logic shared by the runtime.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod codec;
pub mod decision;
pub mod diff;
pub mod entry;
pub mod fingerprint;
pub mod replay;
pub mod state;
pub mod types;
