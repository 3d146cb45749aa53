//! Runtime configuration stored as TOML (default `steplog.toml`).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "steplog.toml";

/// Runtime configuration (TOML).
///
/// Edited by humans; every field is optional and falls back to the defaults
/// below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding `<execution_id>.wal` files.
    pub wal_dir: PathBuf,

    /// Retry budget for steps that are not STATE_CHANGING.
    pub max_retries: u32,

    /// Retry count at which the recovery guard gives up regardless of reason.
    pub max_retry_threshold: u32,

    /// Upper bound on the exponential backoff, in seconds.
    pub backoff_cap_secs: u64,

    /// Timeout for tools whose schema declares none.
    pub default_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from(".steplog/wal"),
            max_retries: 3,
            max_retry_threshold: 5,
            backoff_cap_secs: 30,
            default_timeout_ms: 30_000,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.wal_dir.as_os_str().is_empty() {
            return Err(anyhow!("wal_dir must be non-empty"));
        }
        if self.max_retry_threshold == 0 {
            return Err(anyhow!("max_retry_threshold must be > 0"));
        }
        if self.backoff_cap_secs == 0 {
            return Err(anyhow!("backoff_cap_secs must be > 0"));
        }
        if self.default_timeout_ms == 0 {
            return Err(anyhow!("default_timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// Same config with `wal_dir` resolved against `root` when relative.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        if self.wal_dir.is_relative() {
            self.wal_dir = root.join(&self.wal_dir);
        }
        self
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RuntimeConfig::default()`.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file; using defaults");
        let cfg = RuntimeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RuntimeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    debug!(path = %path.display(), wal_dir = %cfg.wal_dir.display(), "config loaded");
    Ok(cfg)
}

/// Write config durably: fsynced temp file renamed over `path`.
pub fn write_config(path: &Path, cfg: &RuntimeConfig) -> Result<()> {
    cfg.validate()?;
    let body = toml::to_string_pretty(cfg).context("encode runtime config")?;
    replace_file(path, format!("{body}\n").as_bytes())?;
    debug!(path = %path.display(), "config written");
    Ok(())
}

fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let Some(dir) = path.parent() else {
        return Err(anyhow!("{} has no parent directory", path.display()));
    };
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let staging = path.with_extension("toml.tmp");
    let mut file =
        File::create(&staging).with_context(|| format!("create {}", staging.display()))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("write {}", staging.display()))?;
    drop(file);
    fs::rename(&staging, path)
        .with_context(|| format!("rename {} -> {}", staging.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("steplog.toml");
        let cfg = RuntimeConfig {
            max_retries: 1,
            backoff_cap_secs: 4,
            ..RuntimeConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("steplog.toml");
        fs::write(&path, "max_retries = 0\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 0);
        assert_eq!(cfg.backoff_cap_secs, 30);
    }

    #[test]
    fn zero_backoff_cap_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("steplog.toml");
        fs::write(&path, "backoff_cap_secs = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("backoff_cap_secs must be > 0"));
    }

    #[test]
    fn relative_wal_dir_is_rooted() {
        let cfg = RuntimeConfig::default().rooted_at(Path::new("/srv/app"));
        assert_eq!(cfg.wal_dir, PathBuf::from("/srv/app/.steplog/wal"));
    }
}
