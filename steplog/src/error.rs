//! Typed errors for the WAL and registry layers.
//!
//! Orchestration code wraps these in `anyhow::Error` and recovers the typed
//! cause with `downcast_ref` where the distinction drives a decision.

use std::path::PathBuf;

use thiserror::Error;

/// A WAL line failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("integrity check failed at line {line}: {kind}")]
pub struct IntegrityError {
    /// 1-based line number of the offending entry.
    pub line: usize,
    pub kind: IntegrityKind,
}

/// What exactly was wrong with a WAL line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityKind {
    #[error("malformed json: {0}")]
    MalformedJson(String),
    #[error("entry is not a json object")]
    NotAnObject,
    #[error("missing entry_hash")]
    MissingHash,
    #[error("entry_hash mismatch (stored {stored}, computed {computed})")]
    HashMismatch { stored: String, computed: String },
    #[error("hash chain broken (prev_hash {found:?}, expected {expected:?})")]
    ChainBreak {
        expected: Option<String>,
        found: Option<String>,
    },
    #[error("sequence gap (expected seq {expected}, found {found})")]
    SequenceGap { expected: u64, found: u64 },
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
}

/// A WAL writer session cannot proceed.
///
/// Any of these is fatal to the session; the execution is treated as failed.
#[derive(Debug, Error)]
pub enum WalWriteError {
    #[error("invalid execution id {0:?}")]
    InvalidExecutionId(String),
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("duplicate idempotency key {key} for state-changing step {step_id}")]
    DuplicateIdempotencyKey { key: String, step_id: String },
    #[error("commit for step {found} but pending step is {expected:?}")]
    StepIdMismatch {
        expected: Option<String>,
        found: String,
    },
    #[error("wal {0} already holds entries; resume it instead")]
    ExistingLog(PathBuf),
    #[error("writer for execution {0} is closed")]
    Closed(String),
    #[error("wal file {path} belongs to execution {found}, not {expected}")]
    ExecutionMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("wal io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encode wal entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// A WAL could not be read back.
#[derive(Debug, Error)]
pub enum WalReadError {
    #[error("read wal {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl From<WalReadError> for WalWriteError {
    fn from(err: WalReadError) -> Self {
        match err {
            WalReadError::Io { path, source } => WalWriteError::Io { path, source },
            WalReadError::Integrity(err) => WalWriteError::Integrity(err),
        }
    }
}

/// A tool schema was rejected at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tool {0} is already registered")]
    DuplicateTool(String),
    #[error("state-changing tool {name} declares max_retries={max_retries}; must be 0")]
    RetryingStateChanging { name: String, max_retries: u32 },
    #[error("tool name must be non-empty")]
    EmptyName,
    #[error("unknown tool {0}")]
    UnknownTool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_error_names_the_line() {
        let err = IntegrityError {
            line: 4,
            kind: IntegrityKind::ChainBreak {
                expected: Some("abc".to_string()),
                found: None,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("line 4"));
        assert!(msg.contains("hash chain broken"));
    }

    #[test]
    fn write_error_wraps_integrity_transparently() {
        let err = WalWriteError::from(IntegrityError {
            line: 2,
            kind: IntegrityKind::MissingHash,
        });
        assert_eq!(
            err.to_string(),
            "integrity check failed at line 2: missing entry_hash"
        );
    }
}
