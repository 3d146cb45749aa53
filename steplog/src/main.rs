//! Operator CLI for steplog WALs.
//!
//! Verifies, inspects, repairs and compares write-ahead logs, and reports
//! what crash recovery would decide for each execution.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};

use steplog::core::diff::{DriftKind, DriftPolicy, evaluate};
use steplog::core::types::RecoveryDecision;
use steplog::exit_codes;
use steplog::io::config::{DEFAULT_CONFIG_FILE, load_config};
use steplog::io::recovery::RecoveryEngine;
use steplog::io::replay::diff_wals;
use steplog::io::wal_reader::{WalReader, truncate_to_valid_prefix};
use steplog::logging;

#[derive(Parser)]
#[command(
    name = "steplog",
    version,
    about = "Inspect and recover deterministic step execution logs"
)]
struct Cli {
    /// Runtime config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Strictly verify a WAL's hash chain and sequence.
    Verify { wal: PathBuf },
    /// Print state, pending step and fingerprint of a WAL.
    Inspect {
        wal: PathBuf,
        /// Stop at the first invalid entry instead of failing.
        #[arg(long)]
        partial: bool,
    },
    /// Print the recovery decision for one execution.
    Recover { execution_id: String },
    /// List every execution in the WAL directory that is not complete.
    Scan,
    /// Compare two WALs and judge the drift.
    Diff {
        expected: PathBuf,
        actual: PathBuf,
        /// Non-critical drifts tolerated before failing.
        #[arg(long, default_value_t = 0)]
        max_drifts: usize,
        /// Drift kinds that never count (side_effect still fails).
        #[arg(long = "ignore", value_parser = parse_drift_kind)]
        ignore: Vec<DriftKind>,
    },
    /// Cut a WAL back to its longest valid prefix.
    Truncate { wal: PathBuf },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Verify { wal } => cmd_verify(&wal),
        Command::Inspect { wal, partial } => cmd_inspect(&wal, partial),
        Command::Recover { execution_id } => cmd_recover(&cli.config, &execution_id),
        Command::Scan => cmd_scan(&cli.config),
        Command::Diff {
            expected,
            actual,
            max_drifts,
            ignore,
        } => cmd_diff(&expected, &actual, max_drifts, ignore),
        Command::Truncate { wal } => cmd_truncate(&wal),
    }
}

fn cmd_verify(wal: &Path) -> Result<i32> {
    let report = WalReader::verify(wal).with_context(|| format!("verify {}", wal.display()))?;
    print_json(&report)?;
    Ok(exit_codes::OK)
}

fn cmd_inspect(wal: &Path, partial: bool) -> Result<i32> {
    let reader =
        WalReader::open(wal, partial).with_context(|| format!("load {}", wal.display()))?;
    let state = reader.reconstruct_state();
    let pending = reader.pending_step().map(|entry| {
        json!({
            "step_id": entry.step_id,
            "intent": entry.intent,
            "tool_name": entry.tool_name,
            "execution_order": entry.execution_order,
            "side_effect_class": entry.side_effect_class,
        })
    });
    print_json(&json!({
        "path": wal.display().to_string(),
        "execution_id": reader.execution_id(),
        "state": reader.execution_state(),
        "entries": reader.entries().len(),
        "committed_steps": state.committed_steps,
        "pending_step": pending.unwrap_or(Value::Null),
        "fingerprint": reader.get_fingerprint(),
        "computed_fingerprint": state.fingerprint_hash(),
        "load": reader.report(),
    }))?;
    Ok(exit_codes::OK)
}

/// Relative `wal_dir` values resolve against the config file's directory.
fn engine(config_path: &Path) -> Result<RecoveryEngine> {
    let root = config_path.parent().unwrap_or(Path::new("."));
    let cfg = load_config(config_path)?.rooted_at(root);
    Ok(RecoveryEngine::from_config(&cfg))
}

fn cmd_recover(config_path: &Path, execution_id: &str) -> Result<i32> {
    let analysis = engine(config_path)?.analyze(execution_id)?;
    print_json(&analysis)?;
    Ok(match analysis.decision {
        RecoveryDecision::Abort => exit_codes::ATTENTION,
        RecoveryDecision::Complete | RecoveryDecision::Resume | RecoveryDecision::NotFound => {
            exit_codes::OK
        }
    })
}

fn cmd_scan(config_path: &Path) -> Result<i32> {
    let incomplete = engine(config_path)?.scan_incomplete()?;
    print_json(&incomplete)?;
    let any_abort = incomplete
        .iter()
        .any(|analysis| analysis.decision == RecoveryDecision::Abort);
    Ok(if any_abort {
        exit_codes::ATTENTION
    } else {
        exit_codes::OK
    })
}

fn cmd_diff(
    expected: &Path,
    actual: &Path,
    max_drifts: usize,
    ignore: Vec<DriftKind>,
) -> Result<i32> {
    let result = diff_wals(expected, actual)?;
    let policy = DriftPolicy {
        max_drifts,
        ignored_kinds: ignore.into_iter().collect::<BTreeSet<_>>(),
    };
    let verdict = evaluate(&result, &policy);
    print_json(&json!({ "diff": result, "verdict": verdict }))?;
    Ok(if verdict.passed() {
        exit_codes::OK
    } else {
        exit_codes::ATTENTION
    })
}

fn cmd_truncate(wal: &Path) -> Result<i32> {
    let report =
        truncate_to_valid_prefix(wal).with_context(|| format!("truncate {}", wal.display()))?;
    print_json(&report)?;
    Ok(exit_codes::OK)
}

fn parse_drift_kind(raw: &str) -> Result<DriftKind, String> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| format!("unknown drift kind {raw:?}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{out}");
    Ok(())
}
