//! Crash recovery over a directory of WALs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{RecoveryAnalysis, classify, should_abort_retry};
use crate::core::types::{RecoveryDecision, RetryReason};
use crate::error::WalReadError;
use crate::io::config::RuntimeConfig;
use crate::io::wal_reader::WalReader;
use crate::io::wal_writer::{validate_execution_id, wal_path};

/// Decides what to do with each execution found in `wal_dir`.
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    wal_dir: PathBuf,
    max_retry_threshold: u32,
}

impl RecoveryEngine {
    pub fn new(wal_dir: impl Into<PathBuf>, max_retry_threshold: u32) -> Self {
        Self {
            wal_dir: wal_dir.into(),
            max_retry_threshold,
        }
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self::new(cfg.wal_dir.clone(), cfg.max_retry_threshold)
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    pub fn wal_path(&self, execution_id: &str) -> PathBuf {
        wal_path(&self.wal_dir, execution_id)
    }

    /// Analyze one execution's WAL.
    ///
    /// Only I/O failures other than a missing file surface as `Err`; every
    /// other outcome is a decision.
    #[instrument(skip_all, fields(execution_id = %execution_id))]
    pub fn analyze(&self, execution_id: &str) -> Result<RecoveryAnalysis> {
        validate_execution_id(execution_id)?;
        let path = self.wal_path(execution_id);
        if !path.exists() {
            debug!("no wal found");
            return Ok(RecoveryAnalysis::not_found(execution_id));
        }

        let reader = match WalReader::open(&path, false) {
            Ok(reader) => reader,
            Err(WalReadError::Integrity(err)) => {
                warn!(err = %err, "wal failed integrity check");
                return Ok(RecoveryAnalysis::integrity_failure(
                    execution_id,
                    &format!("line {}: {}", err.line, err.kind),
                ));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("analyze {}", path.display()));
            }
        };

        if let Some(found) = reader.execution_id()
            && found != execution_id
        {
            return Ok(RecoveryAnalysis::integrity_failure(
                execution_id,
                &format!("wal records execution {found}"),
            ));
        }

        let analysis = classify(
            execution_id,
            reader.last_entry(),
            reader.pending_step(),
            reader.reconstruct_state(),
        );
        info!(
            decision = %analysis.decision,
            resume_from = analysis.can_resume_from,
            reason = %analysis.reason,
            "recovery analyzed"
        );
        Ok(analysis)
    }

    /// Every execution in `wal_dir` that is neither complete nor missing.
    #[instrument(skip_all, fields(wal_dir = %self.wal_dir.display()))]
    pub fn scan_incomplete(&self) -> Result<Vec<RecoveryAnalysis>> {
        let mut found = Vec::new();
        for execution_id in self.list_executions()? {
            let analysis = self.analyze(&execution_id)?;
            if !matches!(
                analysis.decision,
                RecoveryDecision::Complete | RecoveryDecision::NotFound
            ) {
                found.push(analysis);
            }
        }
        debug!(incomplete = found.len(), "scan finished");
        Ok(found)
    }

    /// Execution ids with a `.wal` file in `wal_dir`, sorted.
    pub fn list_executions(&self) -> Result<Vec<String>> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.wal_dir)
            .with_context(|| format!("read wal dir {}", self.wal_dir.display()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("read wal dir {}", self.wal_dir.display()))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "wal")
                && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
                && validate_execution_id(stem).is_ok()
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Secondary retry guard using the configured threshold.
    pub fn should_abort_retry(&self, retry_count: u32, reason: Option<RetryReason>) -> bool {
        should_abort_retry(retry_count, reason, self.max_retry_threshold)
    }
}
