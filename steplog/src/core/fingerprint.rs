//! Deterministic execution fingerprint.
//!
//! The fingerprint accumulates one slot per committed step and is hashed once
//! at the end. Nothing wall-clock dependent is ever added, so identical step
//! sequences hash identically on any machine at any time.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::codec::{canonical_value_bytes, sha256_hex};
use crate::core::entry::WalEntry;
use crate::core::types::{EntryType, RetryReason};

/// Parallel per-step sequences describing an execution's behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFingerprint {
    pub intents: Vec<String>,
    pub tool_names: Vec<String>,
    pub params_hashes: Vec<String>,
    pub output_hashes: Vec<String>,
    pub retry_patterns: Vec<(u32, Option<RetryReason>)>,
    pub execution_orders: Vec<u32>,
    pub timeout_configs: Vec<u64>,
    pub timeout_flags: Vec<bool>,
}

impl ExecutionFingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one committed step. Other entry types are ignored.
    pub fn add_step(&mut self, entry: &WalEntry) {
        if entry.entry_type != EntryType::StepCommitted {
            return;
        }
        self.intents.push(entry.intent.clone().unwrap_or_default());
        self.tool_names.push(entry.tool_name.clone().unwrap_or_default());
        self.params_hashes.push(entry.params_hash.clone().unwrap_or_default());
        self.output_hashes.push(entry.output_hash.clone().unwrap_or_default());
        self.retry_patterns
            .push((entry.retry_count.unwrap_or(0), entry.retry_reason));
        self.execution_orders.push(entry.execution_order.unwrap_or(0));
        self.timeout_configs.push(entry.timeout_ms());
        self.timeout_flags.push(entry.did_timeout());
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// `SHA256(canonical_json(all sequences))`.
    pub fn compute(&self) -> String {
        let retry_patterns: Vec<_> = self
            .retry_patterns
            .iter()
            .map(|(count, reason)| json!([count, reason.map(RetryReason::as_str)]))
            .collect();
        let payload = json!({
            "intents": self.intents,
            "tool_names": self.tool_names,
            "params_hashes": self.params_hashes,
            "output_hashes": self.output_hashes,
            "retry_patterns": retry_patterns,
            "execution_orders": self.execution_orders,
            "timeout_configs": self.timeout_configs,
            "timeout_flags": self.timeout_flags,
        });
        sha256_hex(&canonical_value_bytes(&payload))
    }
}
