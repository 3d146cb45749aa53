//! Verified read-back of a WAL file.
//!
//! Every line is checked in order: it must parse, link to the previous
//! entry's hash, carry a correct `entry_hash` of its own, and continue the
//! sequence. Readers never take the writer's lock.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::entry::{WalEntry, integrity_hash_of};
use crate::core::state::WalState;
use crate::core::types::{EntryType, ExecutionState};
use crate::error::{IntegrityError, IntegrityKind, WalReadError};

/// What a load found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    /// Entries that passed verification.
    pub valid_entries: usize,
    /// Byte offset just past the last valid line (truncation point).
    pub valid_bytes: u64,
    /// The file ended in a partial line that never reached the disk whole.
    pub torn_tail: bool,
    /// First violation, when loading with `allow_partial`.
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "display")]
    pub violation: Option<IntegrityError>,
}

fn display<S: serde::Serializer>(
    value: &Option<IntegrityError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(err) => serializer.serialize_str(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

impl LoadReport {
    /// True when the file holds bytes past the valid prefix.
    pub fn needs_truncation(&self) -> bool {
        self.torn_tail || self.violation.is_some()
    }
}

/// Loaded, verified view over one WAL file.
#[derive(Debug, Clone)]
pub struct WalReader {
    path: PathBuf,
    entries: Vec<WalEntry>,
    report: LoadReport,
}

impl WalReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            report: LoadReport::default(),
        }
    }

    /// Read and verify the whole file.
    ///
    /// Strict mode fails on the first violation. With `allow_partial` the load
    /// stops at the last valid entry and the violation lands in the report.
    pub fn load(&mut self, allow_partial: bool) -> Result<&LoadReport, WalReadError> {
        let bytes = fs::read(&self.path).map_err(|source| WalReadError::Io {
            path: self.path.clone(),
            source,
        })?;
        let (entries, report) = verify_bytes(&bytes, allow_partial)?;
        debug!(
            path = %self.path.display(),
            entries = entries.len(),
            torn_tail = report.torn_tail,
            "wal loaded"
        );
        if report.torn_tail {
            warn!(path = %self.path.display(), "wal ends in a torn line; ignoring it");
        }
        self.entries = entries;
        self.report = report;
        Ok(&self.report)
    }

    /// Convenience for `new` + `load`.
    pub fn open(path: impl Into<PathBuf>, allow_partial: bool) -> Result<Self, WalReadError> {
        let mut reader = Self::new(path);
        reader.load(allow_partial)?;
        Ok(reader)
    }

    /// Strictly verify `path` without keeping the entries around.
    pub fn verify(path: &Path) -> Result<LoadReport, WalReadError> {
        let mut reader = Self::new(path);
        reader.load(false)?;
        Ok(reader.report)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[WalEntry] {
        &self.entries
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn last_entry(&self) -> Option<&WalEntry> {
        self.entries.last()
    }

    /// Execution id recorded by the first entry.
    pub fn execution_id(&self) -> Option<&str> {
        self.entries.first().map(|entry| entry.execution_id.as_str())
    }

    /// Lifecycle state, derived from the last entry only.
    pub fn execution_state(&self) -> ExecutionState {
        match self.last_entry().map(|entry| entry.entry_type) {
            None => ExecutionState::NotStarted,
            Some(EntryType::ExecutionCompleted) => ExecutionState::Completed,
            Some(EntryType::ExecutionAborted) => ExecutionState::Aborted,
            Some(EntryType::StepFailed) => ExecutionState::Failed,
            Some(
                EntryType::ExecutionStarted | EntryType::StepStarted | EntryType::StepCommitted,
            ) => ExecutionState::InProgress,
        }
    }

    /// Most recent `step.started` with no later commit or failure.
    pub fn pending_step(&self) -> Option<&WalEntry> {
        let mut resolved: HashSet<&str> = HashSet::new();
        for entry in self.entries.iter().rev() {
            let Some(step_id) = entry.step_id.as_deref() else {
                continue;
            };
            match entry.entry_type {
                EntryType::StepCommitted | EntryType::StepFailed => {
                    resolved.insert(step_id);
                }
                EntryType::StepStarted if !resolved.contains(step_id) => return Some(entry),
                _ => {}
            }
        }
        None
    }

    /// Replay every committed entry into a fresh [`WalState`].
    pub fn reconstruct_state(&self) -> WalState {
        let mut state = WalState::new(self.execution_id().unwrap_or_default());
        for entry in &self.entries {
            if entry.entry_type == EntryType::StepCommitted {
                state.record_commit(entry);
                state.add_to_fingerprint(entry);
            }
        }
        state.pending_step = self.pending_step().and_then(|entry| entry.step_id.clone());
        state
    }

    /// Fingerprint recorded by `execution.completed`, if the run finished.
    pub fn get_fingerprint(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.entry_type == EntryType::ExecutionCompleted)
            .and_then(|entry| entry.fingerprint.as_deref())
    }

    /// Committed entry for `step_id`, if any.
    pub fn committed_entry(&self, step_id: &str) -> Option<&WalEntry> {
        self.entries.iter().find(|entry| {
            entry.entry_type == EntryType::StepCommitted
                && entry.step_id.as_deref() == Some(step_id)
        })
    }
}

/// Cut `path` back to its longest valid prefix.
///
/// An explicit repair step; nothing in the runtime calls it on its own.
pub fn truncate_to_valid_prefix(path: &Path) -> Result<LoadReport, WalReadError> {
    let mut reader = WalReader::new(path);
    let report = reader.load(true)?.clone();
    if !report.needs_truncation() {
        debug!(path = %path.display(), "wal already clean; nothing to truncate");
        return Ok(report);
    }
    let io_err = |source| WalReadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = OpenOptions::new().write(true).open(path).map_err(io_err)?;
    file.set_len(report.valid_bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    info!(
        path = %path.display(),
        valid_entries = report.valid_entries,
        valid_bytes = report.valid_bytes,
        "truncated wal to valid prefix"
    );
    Ok(report)
}

/// Verify raw WAL bytes.
pub(crate) fn verify_bytes(
    bytes: &[u8],
    allow_partial: bool,
) -> Result<(Vec<WalEntry>, LoadReport), IntegrityError> {
    let mut entries: Vec<WalEntry> = Vec::new();
    let mut report = LoadReport::default();
    let mut offset = 0usize;
    let mut prev_hash: Option<String> = None;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|byte| *byte == b'\n') else {
            // Unterminated final line: the append never completed.
            report.torn_tail = true;
            break;
        };
        let line = &rest[..newline];
        match verify_line(line, line_no, prev_hash.as_deref(), entries.len() as u64 + 1) {
            Ok((entry, hash)) => {
                prev_hash = Some(hash);
                entries.push(entry);
                offset += newline + 1;
                report.valid_entries = entries.len();
                report.valid_bytes = offset as u64;
            }
            Err(err) if allow_partial => {
                report.violation = Some(err);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok((entries, report))
}

fn verify_line(
    line: &[u8],
    line_no: usize,
    expected_prev: Option<&str>,
    expected_seq: u64,
) -> Result<(WalEntry, String), IntegrityError> {
    let fail = |kind| IntegrityError {
        line: line_no,
        kind,
    };

    let raw: Value = serde_json::from_slice(line)
        .map_err(|err| fail(IntegrityKind::MalformedJson(err.to_string())))?;
    let Value::Object(map) = &raw else {
        return Err(fail(IntegrityKind::NotAnObject));
    };

    let found_prev = match map.get("prev_hash") {
        Some(Value::String(hash)) => Some(hash.as_str()),
        _ => None,
    };
    if found_prev != expected_prev {
        return Err(fail(IntegrityKind::ChainBreak {
            expected: expected_prev.map(str::to_string),
            found: found_prev.map(str::to_string),
        }));
    }

    let Some(Value::String(stored)) = map.get("entry_hash") else {
        return Err(fail(IntegrityKind::MissingHash));
    };
    let computed = integrity_hash_of(&raw);
    if *stored != computed {
        return Err(fail(IntegrityKind::HashMismatch {
            stored: stored.clone(),
            computed,
        }));
    }

    let entry: WalEntry = serde_json::from_value(raw.clone())
        .map_err(|err| fail(IntegrityKind::InvalidEntry(err.to_string())))?;
    if entry.seq != expected_seq {
        return Err(fail(IntegrityKind::SequenceGap {
            expected: expected_seq,
            found: entry.seq,
        }));
    }
    Ok((entry, computed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SideEffectClass;
    use crate::test_support::{sealed_log, write_lines};

    fn step(entry_type: EntryType, step_id: &str, class: SideEffectClass) -> WalEntry {
        let mut entry = WalEntry::new(0, entry_type, "e1", "t");
        entry.step_id = Some(step_id.to_string());
        entry.side_effect_class = Some(class);
        entry
    }

    #[test]
    fn loads_a_clean_chain() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("e1.wal");
        let entries = sealed_log(vec![
            WalEntry::new(0, EntryType::ExecutionStarted, "e1", "t"),
            step(EntryType::StepStarted, "a", SideEffectClass::ReadOnly),
            step(EntryType::StepCommitted, "a", SideEffectClass::ReadOnly),
        ]);
        write_lines(&path, &entries);

        let reader = WalReader::open(&path, false).expect("load");
        assert_eq!(reader.entries().len(), 3);
        assert_eq!(reader.execution_state(), ExecutionState::InProgress);
        assert!(reader.pending_step().is_none());
        assert_eq!(reader.reconstruct_state().committed_steps, vec!["a".to_string()]);
        assert!(!reader.report().needs_truncation());
    }

    #[test]
    fn pending_step_ignores_resolved_starts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("e1.wal");
        let entries = sealed_log(vec![
            WalEntry::new(0, EntryType::ExecutionStarted, "e1", "t"),
            step(EntryType::StepStarted, "a", SideEffectClass::External),
            step(EntryType::StepFailed, "a", SideEffectClass::External),
            step(EntryType::StepStarted, "b", SideEffectClass::StateChanging),
        ]);
        write_lines(&path, &entries);

        let reader = WalReader::open(&path, false).expect("load");
        let pending = reader.pending_step().expect("pending");
        assert_eq!(pending.step_id.as_deref(), Some("b"));
        assert_eq!(reader.reconstruct_state().pending_step.as_deref(), Some("b"));
    }

    #[test]
    fn strict_load_names_the_tampered_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("e1.wal");
        let mut entries = sealed_log(vec![
            WalEntry::new(0, EntryType::ExecutionStarted, "e1", "t"),
            step(EntryType::StepStarted, "a", SideEffectClass::ReadOnly),
            step(EntryType::StepCommitted, "a", SideEffectClass::ReadOnly),
        ]);
        entries[1].intent = Some("tampered".to_string());
        write_lines(&path, &entries);

        let err = WalReader::open(&path, false).expect_err("tampered");
        let WalReadError::Integrity(err) = err else {
            panic!("expected integrity error");
        };
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, IntegrityKind::HashMismatch { .. }));
    }

    #[test]
    fn partial_load_reports_truncation_offset() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("e1.wal");
        let entries = sealed_log(vec![
            WalEntry::new(0, EntryType::ExecutionStarted, "e1", "t"),
            step(EntryType::StepStarted, "a", SideEffectClass::ReadOnly),
        ]);
        write_lines(&path, &entries);
        let good_len = fs::metadata(&path).expect("meta").len();

        // A replayed copy of line 1 parses and hashes fine but breaks the chain.
        let mut contents = fs::read_to_string(&path).expect("read");
        let first = contents.lines().next().expect("line").to_string();
        contents.push_str(&first);
        contents.push('\n');
        fs::write(&path, contents).expect("write");

        let mut reader = WalReader::new(&path);
        let report = reader.load(true).expect("partial load").clone();
        assert_eq!(report.valid_entries, 2);
        assert_eq!(report.valid_bytes, good_len);
        let violation = report.violation.expect("violation");
        assert_eq!(violation.line, 3);
        assert!(matches!(violation.kind, IntegrityKind::ChainBreak { .. }));

        let repaired = truncate_to_valid_prefix(&path).expect("truncate");
        assert_eq!(repaired.valid_entries, 2);
        assert_eq!(fs::metadata(&path).expect("meta").len(), good_len);
        assert!(WalReader::verify(&path).is_ok());
    }

    #[test]
    fn torn_tail_is_not_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("e1.wal");
        let entries = sealed_log(vec![WalEntry::new(
            0,
            EntryType::ExecutionStarted,
            "e1",
            "t",
        )]);
        write_lines(&path, &entries);
        let mut contents = fs::read_to_string(&path).expect("read");
        contents.push_str("{\"seq\":2,\"prev_h");
        fs::write(&path, contents).expect("write");

        let reader = WalReader::open(&path, false).expect("strict load tolerates torn tail");
        assert_eq!(reader.entries().len(), 1);
        assert!(reader.report().torn_tail);
        assert!(reader.report().violation.is_none());
    }

    #[test]
    fn state_follows_last_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("e1.wal");
        let mut done = WalEntry::new(0, EntryType::ExecutionCompleted, "e1", "t");
        done.fingerprint = Some("fp".to_string());
        let entries = sealed_log(vec![
            WalEntry::new(0, EntryType::ExecutionStarted, "e1", "t"),
            done,
        ]);
        write_lines(&path, &entries);

        let reader = WalReader::open(&path, false).expect("load");
        assert_eq!(reader.execution_state(), ExecutionState::Completed);
        assert_eq!(reader.get_fingerprint(), Some("fp"));
    }

    #[test]
    fn empty_file_is_not_started() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("e1.wal");
        fs::write(&path, "").expect("write");
        let reader = WalReader::open(&path, false).expect("load");
        assert_eq!(reader.execution_state(), ExecutionState::NotStarted);
        assert!(reader.execution_id().is_none());
    }
}
