//! Read-only reconstruction of a run from its WAL entries.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::core::entry::WalEntry;
use crate::core::types::{EntryType, RetryReason, SideEffectClass};

/// One step of a reconstructed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayStep {
    pub step_id: String,
    pub execution_order: u32,
    pub intent: String,
    pub tool_name: String,
    pub params_hash: String,
    pub params_snapshot: Option<Value>,
    pub side_effect_class: Option<SideEffectClass>,
    pub output_hash: Option<String>,
    pub output_snapshot: Option<Value>,
    pub retry_count: u32,
    pub retry_reason: Option<RetryReason>,
    pub timeout_ms: u64,
    pub did_timeout: bool,
    pub committed: bool,
    /// Deterministic hash of the `step.committed` entry, when committed.
    pub deterministic_hash: Option<String>,
}

/// A finished (or partially finished) run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayExecution {
    pub execution_id: String,
    pub steps: Vec<ReplayStep>,
    pub completed: bool,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    /// Fingerprint recorded by `execution.completed`.
    pub fingerprint: Option<String>,
}

impl ReplayExecution {
    /// Pair every `step.started` with its `step.committed` (if any) and order
    /// the result by execution order.
    pub fn from_entries(entries: &[WalEntry]) -> Self {
        let execution_id = entries
            .first()
            .map(|entry| entry.execution_id.clone())
            .unwrap_or_default();

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, StepGroup<'_>> = HashMap::new();
        let mut completed = false;
        let mut aborted = false;
        let mut abort_reason = None;
        let mut fingerprint = None;

        for entry in entries {
            match entry.entry_type {
                EntryType::StepStarted | EntryType::StepCommitted | EntryType::StepFailed => {
                    let Some(step_id) = entry.step_id.as_ref() else {
                        continue;
                    };
                    let group = groups.entry(step_id.clone()).or_insert_with(|| {
                        order.push(step_id.clone());
                        StepGroup::default()
                    });
                    match entry.entry_type {
                        EntryType::StepStarted => group.started = Some(entry),
                        EntryType::StepCommitted => group.committed = Some(entry),
                        _ => group.failures.push(entry),
                    }
                }
                EntryType::ExecutionCompleted => {
                    completed = true;
                    fingerprint = entry.fingerprint.clone();
                }
                EntryType::ExecutionAborted => {
                    aborted = true;
                    abort_reason = entry.reason.clone();
                }
                EntryType::ExecutionStarted => {}
            }
        }

        let mut steps: Vec<ReplayStep> = order
            .iter()
            .filter_map(|step_id| {
                groups
                    .get(step_id)
                    .and_then(|group| group.to_step(step_id))
            })
            .collect();
        steps.sort_by_key(|step| step.execution_order);

        Self {
            execution_id,
            steps,
            completed,
            aborted,
            abort_reason,
            fingerprint,
        }
    }

    pub fn committed_steps(&self) -> impl Iterator<Item = &ReplayStep> {
        self.steps.iter().filter(|step| step.committed)
    }
}

#[derive(Default)]
struct StepGroup<'a> {
    started: Option<&'a WalEntry>,
    committed: Option<&'a WalEntry>,
    failures: Vec<&'a WalEntry>,
}

impl StepGroup<'_> {
    fn to_step(&self, step_id: &str) -> Option<ReplayStep> {
        // Committed entries carry the full step description; fall back to the
        // latest start for steps that never committed.
        let source = self.committed.or(self.started)?;
        let (retry_count, retry_reason) = match self.committed {
            Some(committed) => (committed.retry_count.unwrap_or(0), committed.retry_reason),
            None => (
                self.failures.len() as u32,
                self.failures.last().and_then(|failed| failed.retry_reason),
            ),
        };
        let did_timeout = match self.committed {
            Some(committed) => committed.did_timeout(),
            None => self.failures.last().is_some_and(|failed| failed.did_timeout()),
        };
        Some(ReplayStep {
            step_id: step_id.to_string(),
            execution_order: source.execution_order.unwrap_or(0),
            intent: source.intent.clone().unwrap_or_default(),
            tool_name: source.tool_name.clone().unwrap_or_default(),
            params_hash: source.params_hash.clone().unwrap_or_default(),
            params_snapshot: self
                .started
                .and_then(|started| started.params_snapshot.clone())
                .or_else(|| source.params_snapshot.clone()),
            side_effect_class: source.side_effect_class,
            output_hash: self.committed.and_then(|c| c.output_hash.clone()),
            output_snapshot: self.committed.and_then(|c| c.output_snapshot.clone()),
            retry_count,
            retry_reason,
            timeout_ms: source.timeout_ms(),
            did_timeout,
            committed: self.committed.is_some(),
            deterministic_hash: self
                .committed
                .and_then(|committed| committed.deterministic_hash().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LatencyMetadata;
    use serde_json::json;

    fn step_entry(seq: u64, entry_type: EntryType, step_id: &str, order: u32) -> WalEntry {
        let mut entry = WalEntry::new(seq, entry_type, "e1", "t");
        entry.step_id = Some(step_id.to_string());
        entry.execution_order = Some(order);
        entry.intent = Some(format!("intent-{order}"));
        entry.tool_name = Some("tool".to_string());
        entry.params_hash = Some("p".to_string());
        entry.side_effect_class = Some(SideEffectClass::ReadOnly);
        entry.latency_metadata = Some(LatencyMetadata {
            timeout_ms: 100,
            ..LatencyMetadata::default()
        });
        entry
    }

    #[test]
    fn pairs_started_and_committed_in_order() {
        let mut commit2 = step_entry(5, EntryType::StepCommitted, "b", 2);
        commit2.output_hash = Some("o2".to_string());
        commit2.output_snapshot = Some(json!({"v": 2}));
        let entries = vec![
            WalEntry::new(1, EntryType::ExecutionStarted, "e1", "t"),
            step_entry(2, EntryType::StepStarted, "a", 1),
            step_entry(3, EntryType::StepCommitted, "a", 1),
            step_entry(4, EntryType::StepStarted, "b", 2),
            commit2,
            step_entry(6, EntryType::StepStarted, "c", 3),
        ];

        let replay = ReplayExecution::from_entries(&entries);
        assert_eq!(replay.execution_id, "e1");
        let ids: Vec<&str> = replay.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(replay.steps[1].committed);
        assert_eq!(replay.steps[1].output_snapshot, Some(json!({"v": 2})));
        assert!(!replay.steps[2].committed);
        assert_eq!(replay.committed_steps().count(), 2);
        assert!(!replay.completed);
    }

    #[test]
    fn failed_attempts_count_as_retries_for_uncommitted_steps() {
        let mut failed = step_entry(3, EntryType::StepFailed, "a", 1);
        failed.retry_reason = Some(RetryReason::RuntimeError);
        let mut aborted = WalEntry::new(4, EntryType::ExecutionAborted, "e1", "t");
        aborted.reason = Some("boom".to_string());
        let entries = vec![step_entry(2, EntryType::StepStarted, "a", 1), failed, aborted];

        let replay = ReplayExecution::from_entries(&entries);
        assert_eq!(replay.steps[0].retry_count, 1);
        assert_eq!(replay.steps[0].retry_reason, Some(RetryReason::RuntimeError));
        assert!(replay.aborted);
        assert_eq!(replay.abort_reason.as_deref(), Some("boom"));
    }
}
