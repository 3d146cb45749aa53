//! The WAL entry record and its two hashes.
//!
//! - The **integrity hash** covers every serialized field except
//!   `entry_hash` itself (including `prev_hash`, so the chain is tamper
//!   evident).
//! - The **deterministic hash** additionally drops `prev_hash`, `timestamp`
//!   and the wall-clock latency fields, so it is stable across runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::codec::{canonical_value_bytes, sha256_hex};
use crate::core::types::{
    EntryType, LatencyMetadata, RetryReason, SideEffectClass, VOLATILE_LATENCY_KEYS,
};

/// One line of the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Per-log sequence number, starting at 1.
    pub seq: u64,
    /// Hash of the previous entry; `None` only for the first entry.
    pub prev_hash: Option<String>,
    pub entry_type: EntryType,
    pub execution_id: String,
    /// RFC 3339 wall-clock time of the append (informational).
    pub timestamp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_snapshot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_snapshot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effect_class: Option<SideEffectClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<RetryReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_metadata: Option<LatencyMetadata>,

    // step.failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,

    // execution.completed / execution.aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_committed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_hash: Option<String>,
}

impl WalEntry {
    /// An unsealed entry with only the envelope fields set.
    pub fn new(
        seq: u64,
        entry_type: EntryType,
        execution_id: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            seq,
            prev_hash: None,
            entry_type,
            execution_id: execution_id.into(),
            timestamp: timestamp.into(),
            step_id: None,
            intent: None,
            tool_name: None,
            execution_order: None,
            params_hash: None,
            params_snapshot: None,
            output_hash: None,
            output_snapshot: None,
            side_effect_class: None,
            retry_count: None,
            retry_reason: None,
            idempotency_key: None,
            commit: None,
            latency_metadata: None,
            error: None,
            recoverable: None,
            fingerprint: None,
            step_count: None,
            committed_steps: None,
            last_committed_step: None,
            reason: None,
            entry_hash: None,
        }
    }

    /// Link this entry to `prev_hash` and stamp its integrity hash.
    pub fn seal(mut self, prev_hash: Option<String>) -> serde_json::Result<Self> {
        self.prev_hash = prev_hash;
        self.entry_hash = None;
        let hash = self.integrity_hash()?;
        self.entry_hash = Some(hash);
        Ok(self)
    }

    /// Hash over every field except `entry_hash`.
    pub fn integrity_hash(&self) -> serde_json::Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(integrity_hash_of(&value))
    }

    /// Hash over the run-independent fields only.
    pub fn deterministic_hash(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("entry_hash");
            map.remove("prev_hash");
            map.remove("timestamp");
            if let Some(Value::Object(latency)) = map.get_mut("latency_metadata") {
                for key in VOLATILE_LATENCY_KEYS {
                    latency.remove(key);
                }
            }
        }
        Ok(sha256_hex(&canonical_value_bytes(&value)))
    }

    pub fn is_step_scoped(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::StepStarted | EntryType::StepCommitted | EntryType::StepFailed
        )
    }

    pub fn timeout_ms(&self) -> u64 {
        self.latency_metadata
            .as_ref()
            .map(|latency| latency.timeout_ms)
            .unwrap_or(0)
    }

    pub fn did_timeout(&self) -> bool {
        self.latency_metadata
            .as_ref()
            .is_some_and(|latency| latency.did_timeout)
    }
}

/// Integrity hash of a raw JSON entry as read from disk.
///
/// Hashing the parsed line (rather than a re-serialized struct) keeps
/// verification independent of how the reader models optional fields.
pub fn integrity_hash_of(raw: &Value) -> String {
    match raw {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove("entry_hash");
            sha256_hex(&canonical_value_bytes(&Value::Object(map)))
        }
        other => sha256_hex(&canonical_value_bytes(other)),
    }
}
