//! Pure crash-recovery classification.
//!
//! Decides COMPLETE / RESUME / ABORT from what the reader found. The rules are
//! deliberately conservative: a pending STATE_CHANGING step always aborts,
//! because the runtime cannot know whether its side effect happened.

use serde::Serialize;

use crate::core::entry::WalEntry;
use crate::core::state::WalState;
use crate::core::types::{EntryType, RecoveryDecision, RetryReason, SideEffectClass};

pub const REASON_NOT_FOUND: &str = "no WAL exists for execution";
pub const REASON_INTEGRITY: &str = "integrity check failed";
pub const REASON_COMPLETE: &str = "execution already completed";
pub const REASON_PREVIOUSLY_ABORTED: &str = "previously aborted";
pub const REASON_PENDING_STATE_CHANGING: &str =
    "pending STATE_CHANGING step cannot be safely resumed; manual intervention required";

/// Outcome of analyzing one execution's WAL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAnalysis {
    pub execution_id: String,
    pub decision: RecoveryDecision,
    /// Human-readable explanation; always set for ABORT.
    pub reason: String,
    pub state: Option<WalState>,
    pub pending_step_id: Option<String>,
    pub pending_side_effect: Option<SideEffectClass>,
    /// Execution order to resume from (`committed + 1`).
    pub can_resume_from: u32,
}

impl RecoveryAnalysis {
    pub fn not_found(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            decision: RecoveryDecision::NotFound,
            reason: REASON_NOT_FOUND.to_string(),
            state: None,
            pending_step_id: None,
            pending_side_effect: None,
            can_resume_from: 1,
        }
    }

    pub fn integrity_failure(execution_id: impl Into<String>, detail: &str) -> Self {
        Self {
            execution_id: execution_id.into(),
            decision: RecoveryDecision::Abort,
            reason: format!("{REASON_INTEGRITY}: {detail}"),
            state: None,
            pending_step_id: None,
            pending_side_effect: None,
            can_resume_from: 1,
        }
    }
}

/// Classify a cleanly loaded WAL.
///
/// `last` is the final entry (if any), `pending` the started-but-unresolved
/// step entry (if any), and `state` the reconstructed WAL state.
pub fn classify(
    execution_id: &str,
    last: Option<&WalEntry>,
    pending: Option<&WalEntry>,
    state: WalState,
) -> RecoveryAnalysis {
    let can_resume_from = state.resume_order();
    let mut analysis = RecoveryAnalysis {
        execution_id: execution_id.to_string(),
        decision: RecoveryDecision::Resume,
        reason: String::new(),
        state: None,
        pending_step_id: None,
        pending_side_effect: None,
        can_resume_from,
    };

    match last.map(|entry| entry.entry_type) {
        Some(EntryType::ExecutionCompleted) => {
            analysis.decision = RecoveryDecision::Complete;
            analysis.reason = REASON_COMPLETE.to_string();
            analysis.state = Some(state);
            return analysis;
        }
        Some(EntryType::ExecutionAborted) => {
            let detail = last.and_then(|entry| entry.reason.as_deref());
            analysis.decision = RecoveryDecision::Abort;
            analysis.reason = match detail {
                Some(detail) => format!("{REASON_PREVIOUSLY_ABORTED}: {detail}"),
                None => REASON_PREVIOUSLY_ABORTED.to_string(),
            };
            analysis.state = Some(state);
            return analysis;
        }
        None => {
            analysis.reason = "no entries recorded; starting from step 1".to_string();
            analysis.state = Some(state);
            return analysis;
        }
        Some(
            EntryType::ExecutionStarted
            | EntryType::StepStarted
            | EntryType::StepCommitted
            | EntryType::StepFailed,
        ) => {}
    }

    let Some(pending) = pending else {
        analysis.reason = format!(
            "no pending step; resuming at step {can_resume_from} after {} committed",
            state.committed_steps.len()
        );
        analysis.state = Some(state);
        return analysis;
    };

    analysis.pending_step_id = pending.step_id.clone();
    analysis.pending_side_effect = pending.side_effect_class;

    // A pending entry without a class is treated as the most dangerous kind.
    let class = pending
        .side_effect_class
        .unwrap_or(SideEffectClass::StateChanging);
    match class {
        SideEffectClass::StateChanging => {
            analysis.decision = RecoveryDecision::Abort;
            analysis.reason = REASON_PENDING_STATE_CHANGING.to_string();
        }
        SideEffectClass::ReadOnly | SideEffectClass::External => {
            analysis.reason = format!(
                "pending {class} step {} is safe to re-attempt; resuming at step {can_resume_from}",
                pending.step_id.as_deref().unwrap_or("?")
            );
        }
    }
    analysis.state = Some(state);
    analysis
}

/// Secondary retry guard: stop when the budget is spent or the reason is
/// never worth retrying.
pub fn should_abort_retry(
    retry_count: u32,
    reason: Option<RetryReason>,
    max_retry_threshold: u32,
) -> bool {
    if retry_count >= max_retry_threshold {
        return true;
    }
    matches!(
        reason,
        Some(RetryReason::MalformedOutput | RetryReason::RuntimeError)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(entry_type: EntryType) -> WalEntry {
        WalEntry::new(1, entry_type, "e1", "t")
    }

    fn pending(class: SideEffectClass) -> WalEntry {
        let mut entry = entry(EntryType::StepStarted);
        entry.step_id = Some("s2".to_string());
        entry.side_effect_class = Some(class);
        entry
    }

    fn state_with_commits(n: usize) -> WalState {
        let mut state = WalState::new("e1");
        for i in 0..n {
            state.committed_steps.push(format!("s{i}"));
        }
        state
    }

    #[test]
    fn completed_log_is_complete() {
        let last = entry(EntryType::ExecutionCompleted);
        let analysis = classify("e1", Some(&last), None, state_with_commits(2));
        assert_eq!(analysis.decision, RecoveryDecision::Complete);
    }

    #[test]
    fn aborted_log_aborts_with_reason() {
        let mut last = entry(EntryType::ExecutionAborted);
        last.reason = Some("tool exploded".to_string());
        let analysis = classify("e1", Some(&last), None, state_with_commits(0));
        assert_eq!(analysis.decision, RecoveryDecision::Abort);
        assert!(analysis.reason.contains(REASON_PREVIOUSLY_ABORTED));
        assert!(analysis.reason.contains("tool exploded"));
    }

    #[test]
    fn pending_state_changing_always_aborts() {
        for committed in [0, 1, 5, 40] {
            let pending = pending(SideEffectClass::StateChanging);
            let last = pending.clone();
            let analysis = classify(
                "e1",
                Some(&last),
                Some(&pending),
                state_with_commits(committed),
            );
            assert_eq!(analysis.decision, RecoveryDecision::Abort);
            assert_eq!(analysis.reason, REASON_PENDING_STATE_CHANGING);
            assert_eq!(
                analysis.pending_side_effect,
                Some(SideEffectClass::StateChanging)
            );
        }
    }

    #[test]
    fn pending_read_only_or_external_resumes() {
        for class in [SideEffectClass::ReadOnly, SideEffectClass::External] {
            let pending = pending(class);
            let analysis = classify("e1", Some(&pending), Some(&pending), state_with_commits(1));
            assert_eq!(analysis.decision, RecoveryDecision::Resume);
            assert_eq!(analysis.can_resume_from, 2);
            assert_eq!(analysis.pending_step_id.as_deref(), Some("s2"));
        }
    }

    #[test]
    fn no_pending_step_resumes_after_commits() {
        let last = entry(EntryType::StepCommitted);
        let analysis = classify("e1", Some(&last), None, state_with_commits(3));
        assert_eq!(analysis.decision, RecoveryDecision::Resume);
        assert_eq!(analysis.can_resume_from, 4);
    }

    #[test]
    fn retry_guard_trips_on_threshold_or_fatal_reason() {
        assert!(should_abort_retry(3, Some(RetryReason::Timeout), 3));
        assert!(should_abort_retry(0, Some(RetryReason::RuntimeError), 3));
        assert!(should_abort_retry(0, Some(RetryReason::MalformedOutput), 3));
        assert!(!should_abort_retry(1, Some(RetryReason::NetworkError), 3));
        assert!(!should_abort_retry(0, None, 3));
    }
}
