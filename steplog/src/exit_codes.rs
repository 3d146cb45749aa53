//! Stable exit codes for `steplog` commands.

/// Command succeeded; nothing needs attention.
pub const OK: i32 = 0;
/// Command failed: unreadable config, corrupt WAL, or other errors.
pub const INVALID: i32 = 1;
/// A recovery scan found an execution to abort, or a diff found failing drift.
pub const ATTENTION: i32 = 2;
