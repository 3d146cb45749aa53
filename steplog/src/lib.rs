//! Deterministic step execution with a crash-safe audit log.
//!
//! Every step a workflow runs is written to an append-only, hash-chained,
//! fsync-durable write-ahead log before its tool is invoked and committed
//! after it returns. The crate is split the same way throughout:
//!
//! - **[`core`]**: pure, deterministic logic (canonical hashing, entry model,
//!   fingerprint, recovery classification, drift diff). No I/O.
//! - **[`io`]**: side effects (WAL files and locks, recovery scans, replay
//!   loading, config, network adapter).
//!
//! [`runtime`] orchestrates the two to execute and resume workflows of
//! [`tool`] invocations.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tool;
