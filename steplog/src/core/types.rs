//! Closed vocabularies shared by the WAL, recovery, and replay layers.
//!
//! Every tag that reaches disk is a serde-renamed enum variant so the on-disk
//! strings stay stable while matches stay exhaustive.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Side-effect classification of a tool.
///
/// Governs retry eligibility and how conservative crash recovery must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SideEffectClass {
    /// Pure reads; safe to repeat.
    ReadOnly,
    /// Irreversible mutation; never retried, never resumed blindly.
    StateChanging,
    /// Calls into another system whose effects are assumed repeatable.
    External,
}

impl SideEffectClass {
    pub fn is_state_changing(self) -> bool {
        self == SideEffectClass::StateChanging
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SideEffectClass::ReadOnly => "READ_ONLY",
            SideEffectClass::StateChanging => "STATE_CHANGING",
            SideEffectClass::External => "EXTERNAL",
        }
    }
}

impl fmt::Display for SideEffectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step attempt failed (and whether another attempt is allowed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    Timeout,
    MalformedOutput,
    RuntimeError,
    NetworkError,
    RateLimited,
}

impl RetryReason {
    /// Transient reasons that may be retried on non-state-changing steps.
    pub fn is_retryable(self) -> bool {
        match self {
            RetryReason::Timeout | RetryReason::NetworkError | RetryReason::RateLimited => true,
            RetryReason::MalformedOutput | RetryReason::RuntimeError => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetryReason::Timeout => "timeout",
            RetryReason::MalformedOutput => "malformed_output",
            RetryReason::RuntimeError => "runtime_error",
            RetryReason::NetworkError => "network_error",
            RetryReason::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag of a WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.committed")]
    StepCommitted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.aborted")]
    ExecutionAborted,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::ExecutionStarted => "execution.started",
            EntryType::StepStarted => "step.started",
            EntryType::StepCommitted => "step.committed",
            EntryType::StepFailed => "step.failed",
            EntryType::ExecutionCompleted => "execution.completed",
            EntryType::ExecutionAborted => "execution.aborted",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an execution, derived from the last WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    NotStarted,
    InProgress,
    Completed,
    Aborted,
    Failed,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::NotStarted => "not_started",
            ExecutionState::InProgress => "in_progress",
            ExecutionState::Completed => "completed",
            ExecutionState::Aborted => "aborted",
            ExecutionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal verdict of crash recovery for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryDecision {
    Complete,
    Resume,
    Abort,
    NotFound,
}

impl fmt::Display for RecoveryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryDecision::Complete => "COMPLETE",
            RecoveryDecision::Resume => "RESUME",
            RecoveryDecision::Abort => "ABORT",
            RecoveryDecision::NotFound => "NOT_FOUND",
        };
        f.write_str(s)
    }
}

/// Timing recorded for a step attempt.
///
/// `start_time`, `end_time` and `duration_ms` are wall-clock values and are
/// excluded from deterministic hashes. The remaining fields are stable across
/// runs with the same configuration and retry pattern.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LatencyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timeout_ms: u64,
    pub did_timeout: bool,
    pub retry_triggered: bool,
}

/// Keys inside `latency_metadata` that depend on the wall clock.
pub const VOLATILE_LATENCY_KEYS: [&str; 3] = ["start_time", "end_time", "duration_ms"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_type_serializes_with_dotted_tags() {
        let raw = serde_json::to_string(&EntryType::StepCommitted).expect("serialize");
        assert_eq!(raw, "\"step.committed\"");
        let parsed: EntryType = serde_json::from_str("\"execution.aborted\"").expect("parse");
        assert_eq!(parsed, EntryType::ExecutionAborted);
    }

    #[test]
    fn side_effect_class_uses_upper_snake_tags() {
        let raw = serde_json::to_string(&SideEffectClass::StateChanging).expect("serialize");
        assert_eq!(raw, "\"STATE_CHANGING\"");
        assert_eq!(SideEffectClass::ReadOnly.to_string(), "READ_ONLY");
    }

    #[test]
    fn only_transient_reasons_are_retryable() {
        assert!(RetryReason::Timeout.is_retryable());
        assert!(RetryReason::NetworkError.is_retryable());
        assert!(RetryReason::RateLimited.is_retryable());
        assert!(!RetryReason::RuntimeError.is_retryable());
        assert!(!RetryReason::MalformedOutput.is_retryable());
    }

    #[test]
    fn latency_omits_absent_wall_clock_fields() {
        let latency = LatencyMetadata {
            timeout_ms: 500,
            ..LatencyMetadata::default()
        };
        let raw = serde_json::to_string(&latency).expect("serialize");
        assert_eq!(
            raw,
            "{\"timeout_ms\":500,\"did_timeout\":false,\"retry_triggered\":false}"
        );
    }
}
