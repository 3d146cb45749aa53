//! Loading replay executions from disk.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::diff::{DiffResult, diff};
use crate::core::replay::ReplayExecution;
use crate::io::wal_reader::WalReader;

/// Strictly load `path` and rebuild the run it records.
pub fn load_from_wal(path: &Path) -> Result<ReplayExecution> {
    let reader =
        WalReader::open(path, false).with_context(|| format!("load wal {}", path.display()))?;
    let replay = ReplayExecution::from_entries(reader.entries());
    debug!(
        path = %path.display(),
        steps = replay.steps.len(),
        completed = replay.completed,
        "replay loaded"
    );
    Ok(replay)
}

/// Diff two WAL files, `expected` first.
pub fn diff_wals(expected: &Path, actual: &Path) -> Result<DiffResult> {
    let expected = load_from_wal(expected)?;
    let actual = load_from_wal(actual)?;
    Ok(diff(&expected, &actual))
}
