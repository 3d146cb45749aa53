//! In-memory reconstruction of an execution's WAL.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::entry::WalEntry;
use crate::core::fingerprint::ExecutionFingerprint;

/// Derived state of one execution's log.
///
/// Built fresh by a writer session, or rebuilt from disk by the reader. Only
/// the writer holding the exclusive lock mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WalState {
    pub execution_id: String,
    /// Sequence number of the last `step.committed` entry (0 if none).
    pub last_committed_seq: u64,
    pub last_committed_step: Option<String>,
    /// Committed step ids in execution order.
    pub committed_steps: Vec<String>,
    /// Step that was started but neither committed nor failed.
    pub pending_step: Option<String>,
    #[serde(skip)]
    pub fingerprint: ExecutionFingerprint,
    pub idempotency_keys: BTreeSet<String>,
}

impl WalState {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            ..Self::default()
        }
    }

    /// Record a `step.committed` entry as the new committed head.
    pub fn record_commit(&mut self, entry: &WalEntry) {
        let Some(step_id) = entry.step_id.clone() else {
            return;
        };
        if self.pending_step.as_deref() == Some(step_id.as_str()) {
            self.pending_step = None;
        }
        self.last_committed_seq = entry.seq;
        self.last_committed_step = Some(step_id.clone());
        self.committed_steps.push(step_id);
    }

    /// Feed a committed entry to the fingerprint and mark its key as used.
    pub fn add_to_fingerprint(&mut self, entry: &WalEntry) {
        self.fingerprint.add_step(entry);
        if let Some(key) = &entry.idempotency_key {
            self.idempotency_keys.insert(key.clone());
        }
    }

    pub fn is_key_used(&self, key: &str) -> bool {
        self.idempotency_keys.contains(key)
    }

    /// Execution order the next step runs at (`committed + 1`).
    pub fn resume_order(&self) -> u32 {
        self.committed_steps.len() as u32 + 1
    }

    pub fn fingerprint_hash(&self) -> String {
        self.fingerprint.compute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EntryType;

    #[test]
    fn commit_clears_matching_pending_and_advances_resume_point() {
        let mut state = WalState::new("e1");
        state.pending_step = Some("s1".to_string());

        let mut entry = WalEntry::new(3, EntryType::StepCommitted, "e1", "t");
        entry.step_id = Some("s1".to_string());
        entry.idempotency_key = Some("k1".to_string());
        state.record_commit(&entry);
        state.add_to_fingerprint(&entry);

        assert_eq!(state.pending_step, None);
        assert_eq!(state.committed_steps, vec!["s1".to_string()]);
        assert_eq!(state.last_committed_seq, 3);
        assert_eq!(state.resume_order(), 2);
        assert!(state.is_key_used("k1"));
        assert_eq!(state.fingerprint.len(), 1);
    }

    #[test]
    fn commit_for_other_step_keeps_pending() {
        let mut state = WalState::new("e1");
        state.pending_step = Some("s2".to_string());
        let mut entry = WalEntry::new(2, EntryType::StepCommitted, "e1", "t");
        entry.step_id = Some("s1".to_string());
        state.record_commit(&entry);
        assert_eq!(state.pending_step.as_deref(), Some("s2"));
    }
}
