//! Append-only, hash-chained, fsync-durable WAL writer.
//!
//! One writer per execution, guarded by an exclusive lock on
//! `<execution_id>.wal.lock`. Every append is serialize, write the line,
//! flush, `sync_data`; an entry is durable once that returns.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::codec::{hash_value, idempotency_key, step_id};
use crate::core::entry::WalEntry;
use crate::core::state::WalState;
use crate::core::types::{EntryType, LatencyMetadata, RetryReason, SideEffectClass};
use crate::error::WalWriteError;
use crate::io::lock::LockGuard;
use crate::io::wal_reader::WalReader;

/// `<dir>/<execution_id>.wal`.
pub fn wal_path(dir: &Path, execution_id: &str) -> PathBuf {
    dir.join(format!("{execution_id}.wal"))
}

/// Companion lock file for a WAL path.
pub fn lock_path(wal: &Path) -> PathBuf {
    let mut os = wal.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Execution ids become file names, so they must be a single path component.
pub fn validate_execution_id(execution_id: &str) -> Result<(), WalWriteError> {
    let bad = execution_id.is_empty()
        || execution_id.contains(['/', '\\', '\0'])
        || execution_id.contains("..");
    if bad {
        return Err(WalWriteError::InvalidExecutionId(execution_id.to_string()));
    }
    Ok(())
}

/// Description of a step about to run.
#[derive(Debug, Clone, Copy)]
pub struct StepStart<'a> {
    pub intent: &'a str,
    pub tool_name: &'a str,
    pub params: &'a Value,
    pub side_effect_class: SideEffectClass,
    pub timeout_ms: u64,
    /// 1-based position of the step in the execution.
    pub execution_order: u32,
}

#[derive(Debug)]
struct Pending {
    started: WalEntry,
    start_ms: i64,
}

/// Exclusive writer for one execution's WAL.
#[derive(Debug)]
pub struct WalWriter {
    path: PathBuf,
    execution_id: String,
    file: Option<File>,
    lock: Option<LockGuard>,
    seq: u64,
    prev_hash: Option<String>,
    state: WalState,
    pending: Option<Pending>,
    finished: bool,
}

impl WalWriter {
    /// Start a fresh log and append `execution.started`.
    ///
    /// Blocks until the lock is free. Fails if the file already holds entries.
    pub fn open(path: &Path, execution_id: &str) -> Result<Self, WalWriteError> {
        validate_execution_id(execution_id)?;
        let lock = LockGuard::acquire(&lock_path(path))?;
        let file = open_append(path)?;
        let len = file
            .metadata()
            .map_err(|source| WalWriteError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if len > 0 {
            return Err(WalWriteError::ExistingLog(path.to_path_buf()));
        }

        let state = WalState::new(execution_id);
        let mut writer = Self::with_parts(path, execution_id, file, lock, state);
        writer.append(WalEntry::new(0, EntryType::ExecutionStarted, execution_id, now()))?;
        info!(execution_id, path = %path.display(), "wal opened");
        Ok(writer)
    }

    /// Reopen an interrupted log, restoring sequence, chain head, committed
    /// steps, used idempotency keys and fingerprint from disk.
    ///
    /// A torn final line is cut off before anything is appended. A log that
    /// already ended in `execution.completed` or `execution.aborted` is closed.
    pub fn resume(path: &Path, execution_id: &str) -> Result<Self, WalWriteError> {
        validate_execution_id(execution_id)?;
        let lock = LockGuard::acquire(&lock_path(path))?;
        let reader = WalReader::open(path, false)?;

        if let Some(found) = reader.execution_id()
            && found != execution_id
        {
            return Err(WalWriteError::ExecutionMismatch {
                path: path.to_path_buf(),
                expected: execution_id.to_string(),
                found: found.to_string(),
            });
        }
        if let Some(last) = reader.last_entry()
            && matches!(
                last.entry_type,
                EntryType::ExecutionCompleted | EntryType::ExecutionAborted
            )
        {
            return Err(WalWriteError::Closed(execution_id.to_string()));
        }

        let file = open_append(path)?;
        if reader.report().torn_tail {
            warn!(
                execution_id,
                valid_bytes = reader.report().valid_bytes,
                "truncating torn wal tail before resuming"
            );
            file.set_len(reader.report().valid_bytes)
                .and_then(|()| file.sync_all())
                .map_err(|source| WalWriteError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        let mut state = reader.reconstruct_state();
        state.execution_id = execution_id.to_string();
        if let Some(step) = state.pending_step.take() {
            debug!(execution_id, step_id = %step, "interrupted step left unresolved in wal");
        }
        let mut writer = Self::with_parts(path, execution_id, file, lock, state);
        writer.seq = reader.entries().len() as u64;
        writer.prev_hash = reader.last_entry().and_then(|entry| entry.entry_hash.clone());

        if reader.entries().is_empty() {
            writer.append(WalEntry::new(0, EntryType::ExecutionStarted, execution_id, now()))?;
        }
        info!(
            execution_id,
            seq = writer.seq,
            committed = writer.state.committed_steps.len(),
            "wal resumed"
        );
        Ok(writer)
    }

    fn with_parts(
        path: &Path,
        execution_id: &str,
        file: File,
        lock: LockGuard,
        state: WalState,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            execution_id: execution_id.to_string(),
            file: Some(file),
            lock: Some(lock),
            seq: 0,
            prev_hash: None,
            state,
            pending: None,
            finished: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn state(&self) -> &WalState {
        &self.state
    }

    /// Sequence number of the last appended entry.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn pending_step_id(&self) -> Option<&str> {
        self.pending
            .as_ref()
            .and_then(|pending| pending.started.step_id.as_deref())
    }

    /// Append `step.started` and mark the step pending.
    ///
    /// A STATE_CHANGING step whose idempotency key was already used in this
    /// execution is rejected before anything is written.
    pub fn log_step_started(&mut self, step: StepStart<'_>) -> Result<WalEntry, WalWriteError> {
        let params_hash = hash_value(step.params)?;
        let id = step_id(
            &self.execution_id,
            step.execution_order,
            step.intent,
            step.tool_name,
        );
        let key = idempotency_key(
            &self.execution_id,
            step.intent,
            step.tool_name,
            &params_hash,
            step.execution_order,
        );
        if step.side_effect_class.is_state_changing() && self.state.is_key_used(&key) {
            return Err(WalWriteError::DuplicateIdempotencyKey { key, step_id: id });
        }
        if let Some(previous) = self.pending_step_id() {
            warn!(previous, step_id = %id, "starting a step while another is unresolved");
        }

        let start_ms = Utc::now().timestamp_millis();
        let mut entry = self.envelope(EntryType::StepStarted);
        entry.step_id = Some(id.clone());
        entry.intent = Some(step.intent.to_string());
        entry.tool_name = Some(step.tool_name.to_string());
        entry.execution_order = Some(step.execution_order);
        entry.params_hash = Some(params_hash);
        entry.params_snapshot = Some(step.params.clone());
        entry.side_effect_class = Some(step.side_effect_class);
        entry.idempotency_key = Some(key);
        entry.latency_metadata = Some(LatencyMetadata {
            start_time: Some(start_ms),
            timeout_ms: step.timeout_ms,
            ..LatencyMetadata::default()
        });

        let entry = self.append(entry)?;
        debug!(step_id = %id, order = step.execution_order, "step started");
        self.state.pending_step = Some(id);
        self.pending = Some(Pending {
            started: entry.clone(),
            start_ms,
        });
        Ok(entry)
    }

    /// Append `step.committed` for the pending step.
    pub fn commit_step(
        &mut self,
        step_id: &str,
        output: &Value,
        retry_count: u32,
        retry_reason: Option<RetryReason>,
    ) -> Result<WalEntry, WalWriteError> {
        let pending = self.take_pending(step_id)?;
        let mut entry =
            self.resolution(EntryType::StepCommitted, &pending, Some(retry_count), retry_reason);
        entry.output_hash = Some(hash_value(output)?);
        entry.output_snapshot = Some(output.clone());
        entry.commit = Some(true);

        let entry = self.append(entry)?;
        self.state.record_commit(&entry);
        debug!(step_id, seq = entry.seq, "step committed");
        Ok(entry)
    }

    /// Append `step.failed`; the step stops being pending.
    pub fn log_step_failed(
        &mut self,
        step_id: &str,
        error: &str,
        retry_reason: Option<RetryReason>,
        recoverable: bool,
    ) -> Result<WalEntry, WalWriteError> {
        let pending = self.take_pending(step_id)?;
        let mut entry = self.resolution(EntryType::StepFailed, &pending, None, retry_reason);
        entry.error = Some(error.to_string());
        entry.recoverable = Some(recoverable);

        let entry = self.append(entry)?;
        self.state.pending_step = None;
        debug!(step_id, recoverable, reason = ?retry_reason, "step failed");
        Ok(entry)
    }

    /// Feed a committed entry to the running fingerprint.
    pub fn add_to_fingerprint(&mut self, entry: &WalEntry) {
        self.state.add_to_fingerprint(entry);
    }

    /// Append `execution.completed` and return the fingerprint hash.
    pub fn finalize(&mut self) -> Result<String, WalWriteError> {
        let fingerprint = self.state.fingerprint_hash();
        let mut entry = self.envelope(EntryType::ExecutionCompleted);
        entry.fingerprint = Some(fingerprint.clone());
        entry.step_count = Some(self.state.committed_steps.len());
        entry.committed_steps = Some(self.state.committed_steps.clone());
        self.append(entry)?;
        self.finished = true;
        info!(
            execution_id = %self.execution_id,
            steps = self.state.committed_steps.len(),
            fingerprint = %fingerprint,
            "execution completed"
        );
        Ok(fingerprint)
    }

    /// Append `execution.aborted`.
    pub fn abort(&mut self, reason: &str) -> Result<WalEntry, WalWriteError> {
        let mut entry = self.envelope(EntryType::ExecutionAborted);
        entry.reason = Some(reason.to_string());
        entry.last_committed_step = self.state.last_committed_step.clone();
        let entry = self.append(entry)?;
        self.finished = true;
        warn!(execution_id = %self.execution_id, reason, "execution aborted");
        Ok(entry)
    }

    /// Flush, fsync, release the lock and drop the handle. Idempotent.
    pub fn close(&mut self) -> Result<(), WalWriteError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let result = file
            .flush()
            .and_then(|()| file.sync_all())
            .map_err(|source| WalWriteError::Io {
                path: self.path.clone(),
                source,
            });
        drop(file);
        if let Some(lock) = self.lock.take() {
            debug!(
                execution_id = %self.execution_id,
                lock = %lock.path().display(),
                "wal closed"
            );
        }
        result
    }

    fn envelope(&self, entry_type: EntryType) -> WalEntry {
        WalEntry::new(0, entry_type, self.execution_id.clone(), now())
    }

    /// Commit/failure entry repeating the pending step's description.
    fn resolution(
        &self,
        entry_type: EntryType,
        pending: &Pending,
        retry_count: Option<u32>,
        retry_reason: Option<RetryReason>,
    ) -> WalEntry {
        let started = &pending.started;
        let end_ms = Utc::now().timestamp_millis();
        let timeout_ms = started.timeout_ms();

        let mut entry = self.envelope(entry_type);
        entry.step_id = started.step_id.clone();
        entry.intent = started.intent.clone();
        entry.tool_name = started.tool_name.clone();
        entry.execution_order = started.execution_order;
        entry.params_hash = started.params_hash.clone();
        entry.side_effect_class = started.side_effect_class;
        entry.idempotency_key = started.idempotency_key.clone();
        entry.retry_count = retry_count;
        entry.retry_reason = retry_reason;
        entry.latency_metadata = Some(LatencyMetadata {
            start_time: Some(pending.start_ms),
            end_time: Some(end_ms),
            duration_ms: Some(u64::try_from(end_ms - pending.start_ms).unwrap_or(0)),
            timeout_ms,
            did_timeout: retry_reason == Some(RetryReason::Timeout),
            retry_triggered: retry_count.is_some_and(|count| count > 0),
        });
        entry
    }

    fn take_pending(&mut self, step_id: &str) -> Result<Pending, WalWriteError> {
        match self.pending.take() {
            Some(pending) if pending.started.step_id.as_deref() == Some(step_id) => Ok(pending),
            other => {
                let expected = other
                    .as_ref()
                    .and_then(|pending| pending.started.step_id.clone());
                self.pending = other;
                Err(WalWriteError::StepIdMismatch {
                    expected,
                    found: step_id.to_string(),
                })
            }
        }
    }

    fn append(&mut self, mut entry: WalEntry) -> Result<WalEntry, WalWriteError> {
        if self.finished {
            return Err(WalWriteError::Closed(self.execution_id.clone()));
        }
        let Some(file) = self.file.as_mut() else {
            return Err(WalWriteError::Closed(self.execution_id.clone()));
        };
        entry.seq = self.seq + 1;
        let entry = entry.seal(self.prev_hash.clone())?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        file.write_all(&line)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data())
            .map_err(|source| WalWriteError::Io {
                path: self.path.clone(),
                source,
            })?;

        self.seq = entry.seq;
        self.prev_hash = entry.entry_hash.clone();
        Ok(entry)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(execution_id = %self.execution_id, err = %err, "failed to close wal");
        }
    }
}

fn open_append(path: &Path) -> Result<File, WalWriteError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| WalWriteError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| WalWriteError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
