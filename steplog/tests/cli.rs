//! CLI tests for the `steplog` binary.
//!
//! Spawns the binary against WALs written by the library and checks exit
//! codes and the JSON it prints.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{Value, json};

use steplog::core::types::SideEffectClass;
use steplog::exit_codes;
use steplog::io::config::write_config;
use steplog::io::wal_writer::{StepStart, WalWriter};
use steplog::test_support::TestWorkspace;

fn steplog(ws: &TestWorkspace, args: &[&str]) -> Output {
    let config = ws.dir.path().join("steplog.toml");
    write_config(&config, &ws.config).expect("write config");
    Command::new(env!("CARGO_BIN_EXE_steplog"))
        .current_dir(ws.dir.path())
        .arg("--config")
        .arg(&config)
        .args(args)
        .output()
        .expect("spawn steplog")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

/// One started step with the given class, never resolved.
fn crashed_wal(path: &Path, execution_id: &str, class: SideEffectClass) {
    let params = json!({"amount": 10});
    let mut writer = WalWriter::open(path, execution_id).expect("open");
    writer
        .log_step_started(StepStart {
            intent: "charge card",
            tool_name: "payments",
            params: &params,
            side_effect_class: class,
            timeout_ms: 5_000,
            execution_order: 1,
        })
        .expect("start");
}

#[test]
fn recover_state_changing_crash_needs_attention() {
    let ws = TestWorkspace::new();
    crashed_wal(&ws.wal_path("pay-1"), "pay-1", SideEffectClass::StateChanging);

    let output = steplog(&ws, &["recover", "pay-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::ATTENTION));
    let analysis = stdout_json(&output);
    assert_eq!(analysis["decision"], "ABORT");
    assert_eq!(analysis["pending_side_effect"], "STATE_CHANGING");
}

#[test]
fn recover_read_only_crash_resumes() {
    let ws = TestWorkspace::new();
    crashed_wal(&ws.wal_path("read-1"), "read-1", SideEffectClass::ReadOnly);

    let output = steplog(&ws, &["recover", "read-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let analysis = stdout_json(&output);
    assert_eq!(analysis["decision"], "RESUME");
    assert_eq!(analysis["can_resume_from"], 1);
}

#[test]
fn recover_unknown_execution_is_not_found() {
    let ws = TestWorkspace::new();
    let output = steplog(&ws, &["recover", "nobody"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["decision"], "NOT_FOUND");
}

#[test]
fn verify_rejects_tampered_wal() {
    let ws = TestWorkspace::new();
    let path = ws.wal_path("t-1");
    crashed_wal(&path, "t-1", SideEffectClass::ReadOnly);
    let contents = fs::read_to_string(&path).expect("read");
    fs::write(&path, contents.replace("charge card", "refund card")).expect("tamper");

    let output = steplog(&ws, &["verify", path.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 2"), "{stderr}");
}

#[test]
fn scan_lists_only_incomplete_executions() {
    let ws = TestWorkspace::new();
    crashed_wal(&ws.wal_path("a"), "a", SideEffectClass::ReadOnly);
    let mut done = WalWriter::open(&ws.wal_path("b"), "b").expect("open");
    done.finalize().expect("finalize");
    done.close().expect("close");

    let output = steplog(&ws, &["scan"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let listed = stdout_json(&output);
    let ids: Vec<&str> = listed
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|analysis| analysis["execution_id"].as_str())
        .collect();
    assert_eq!(ids, vec!["a"]);
}
