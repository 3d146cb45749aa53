//! Test-only helpers: scripted tools, a recording sleeper and WAL fixtures.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::core::entry::WalEntry;
use crate::core::types::SideEffectClass;
use crate::io::config::RuntimeConfig;
use crate::io::wal_writer::wal_path;
use crate::runtime::Sleeper;
use crate::tool::{Tool, ToolError, ToolSchema};

/// Tool that replays a queue of scripted results, then a fallback.
pub struct ScriptedTool {
    schema: ToolSchema,
    script: RefCell<VecDeque<Result<Value, ToolError>>>,
    fallback: Option<Value>,
    delay: Option<Duration>,
    calls: Rc<Cell<usize>>,
    params_seen: Rc<RefCell<Vec<Value>>>,
}

impl ScriptedTool {
    pub fn new(schema: ToolSchema) -> Self {
        Self {
            schema,
            script: RefCell::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: Rc::new(Cell::new(0)),
            params_seen: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn read_only(name: &str) -> Self {
        Self::new(ToolSchema::new(name, SideEffectClass::ReadOnly).timeout_ms(60_000))
    }

    pub fn external(name: &str) -> Self {
        Self::new(ToolSchema::new(name, SideEffectClass::External).timeout_ms(60_000))
    }

    pub fn state_changing(name: &str) -> Self {
        Self::new(ToolSchema::new(name, SideEffectClass::StateChanging).timeout_ms(60_000))
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.schema.max_retries = max_retries;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.schema.timeout_ms = timeout_ms;
        self
    }

    /// Sleep this long inside every call before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn then_ok(mut self, output: Value) -> Self {
        self.script.get_mut().push_back(Ok(output));
        self
    }

    pub fn then_err(mut self, err: ToolError) -> Self {
        self.script.get_mut().push_back(Err(err));
        self
    }

    /// Output returned once the script is exhausted.
    pub fn always(mut self, output: Value) -> Self {
        self.fallback = Some(output);
        self
    }

    /// Shared call counter; stays valid after the tool is registered.
    pub fn calls(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.calls)
    }

    pub fn params_seen(&self) -> Rc<RefCell<Vec<Value>>> {
        Rc::clone(&self.params_seen)
    }
}

impl Tool for ScriptedTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn execute(&self, params: &Value) -> Result<Value, ToolError> {
        self.calls.set(self.calls.get() + 1);
        self.params_seen.borrow_mut().push(params.clone());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(next) = self.script.borrow_mut().pop_front() {
            return next;
        }
        self.fallback
            .clone()
            .ok_or_else(|| ToolError::runtime(format!("{} script exhausted", self.schema.name)))
    }
}

/// Sleeper that records requested delays instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    log: Rc<RefCell<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn log(&self) -> Rc<RefCell<Vec<Duration>>> {
        Rc::clone(&self.log)
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.log.borrow_mut().push(duration);
    }
}

/// Config whose WAL directory lives under `root`.
pub fn test_config(root: &Path) -> RuntimeConfig {
    RuntimeConfig {
        wal_dir: root.join("wal"),
        max_retries: 3,
        max_retry_threshold: 5,
        backoff_cap_secs: 30,
        default_timeout_ms: 60_000,
    }
}

/// Temp directory with a matching [`RuntimeConfig`].
pub struct TestWorkspace {
    pub dir: tempfile::TempDir,
    pub config: RuntimeConfig,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        Self { dir, config }
    }

    pub fn wal_path(&self, execution_id: &str) -> PathBuf {
        wal_path(&self.config.wal_dir, execution_id)
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Number and chain `entries` as a writer would (seq from 1).
pub fn sealed_log(entries: Vec<WalEntry>) -> Vec<WalEntry> {
    let mut prev: Option<String> = None;
    entries
        .into_iter()
        .enumerate()
        .map(|(index, mut entry)| {
            entry.seq = index as u64 + 1;
            let sealed = entry.seal(prev.take()).expect("seal");
            prev = sealed.entry_hash.clone();
            sealed
        })
        .collect()
}

/// Write entries one JSON line each.
pub fn write_lines(path: &Path, entries: &[WalEntry]) {
    let mut contents = String::new();
    for entry in entries {
        contents.push_str(&serde_json::to_string(entry).expect("serialize"));
        contents.push('\n');
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create dir");
    }
    fs::write(path, contents).expect("write wal");
}

/// Deterministic full-precision floats: arbitrary finite bit patterns
/// interleaved with uniform values in `[0, 1)`.
pub fn full_precision_floats(count: usize) -> Vec<f64> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next = move || {
        // splitmix64
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    };
    let mut floats = Vec::with_capacity(count);
    while floats.len() < count {
        let bits = next();
        let value = if floats.len() % 2 == 0 {
            f64::from_bits(bits)
        } else {
            (bits >> 11) as f64 / (1u64 << 53) as f64
        };
        if value.is_finite() {
            floats.push(value);
        }
    }
    floats
}
