//! Step executor.
//!
//! Runs an ordered list of steps against the [`ToolRegistry`], logging each
//! one to the WAL before the tool is invoked and committing it after. A call
//! for an execution id that already has a WAL consults the recovery engine
//! first: completed runs return their recorded outputs, resumable runs skip
//! every committed step, and aborted runs are refused.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::codec::step_id;
use crate::core::decision::RecoveryAnalysis;
use crate::core::types::{EntryType, RecoveryDecision, RetryReason};
use crate::error::WalWriteError;
use crate::io::config::RuntimeConfig;
use crate::io::recovery::RecoveryEngine;
use crate::io::wal_reader::WalReader;
use crate::io::wal_writer::{StepStart, WalWriter, validate_execution_id};
use crate::tool::{Tool, ToolError, ToolRegistry};

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub intent: String,
    pub tool_name: String,
    #[serde(default)]
    pub params: Value,
}

impl StepSpec {
    pub fn new(intent: &str, tool_name: &str, params: Value) -> Self {
        Self {
            intent: intent.to_string(),
            tool_name: tool_name.to_string(),
            params,
        }
    }
}

/// What the caller gets back from [`StepExecutor::run`].
///
/// Step failures never surface as `Err`; they land here with the outputs
/// produced before the failing step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub success: bool,
    pub error: Option<String>,
    /// Outputs of committed steps, in execution order.
    pub outputs: Vec<Value>,
    /// Retries recorded across all committed and attempted steps.
    pub retry_count: u32,
    pub fingerprint: Option<String>,
    /// Recovery decision when a WAL already existed.
    pub decision: Option<RecoveryDecision>,
    /// Execution order the run resumed at, when it resumed.
    pub resumed_from: Option<u32>,
}

impl ExecutionResult {
    fn failed(execution_id: &str, error: String, outputs: Vec<Value>, retry_count: u32) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            success: false,
            error: Some(error),
            outputs,
            retry_count,
            fingerprint: None,
            decision: None,
            resumed_from: None,
        }
    }
}

/// Blocking delay between retries.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// `min(2^retry_count, cap_secs)` seconds. No jitter.
pub fn backoff(retry_count: u32, cap_secs: u64) -> Duration {
    let secs = 2u64
        .checked_pow(retry_count)
        .unwrap_or(u64::MAX)
        .min(cap_secs);
    Duration::from_secs(secs)
}

/// Why a step gave up.
#[derive(Debug)]
struct StepFailure {
    message: String,
    retries: u32,
}

impl StepFailure {
    fn wal(err: WalWriteError, retries: u32) -> Self {
        Self {
            message: format!("wal write failed: {err}"),
            retries,
        }
    }
}

/// Drives steps through the WAL, retry policy and recovery engine.
pub struct StepExecutor<'a> {
    registry: &'a ToolRegistry,
    config: RuntimeConfig,
    recovery: RecoveryEngine,
    sleeper: Box<dyn Sleeper + 'a>,
}

impl<'a> StepExecutor<'a> {
    pub fn new(registry: &'a ToolRegistry, config: RuntimeConfig) -> Self {
        let recovery = RecoveryEngine::from_config(&config);
        Self {
            registry,
            config,
            recovery,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'a) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// Execute (or recover) `execution_id` over `steps`.
    ///
    /// Returns `Err` only for misuse: an invalid execution id or a step that
    /// names an unregistered tool.
    #[instrument(skip_all, fields(execution_id = %execution_id, steps = steps.len()))]
    pub fn run(&self, execution_id: &str, steps: &[StepSpec]) -> Result<ExecutionResult> {
        validate_execution_id(execution_id)?;
        for step in steps {
            self.registry
                .get(&step.tool_name)
                .with_context(|| format!("step {:?}", step.intent))?;
        }

        let analysis = match self.recovery.analyze(execution_id) {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "recovery analysis failed");
                return Ok(ExecutionResult::failed(
                    execution_id,
                    format!("{err:#}"),
                    Vec::new(),
                    0,
                ));
            }
        };
        let path = self.recovery.wal_path(execution_id);

        match analysis.decision {
            RecoveryDecision::NotFound => match WalWriter::open(&path, execution_id) {
                Ok(writer) => Ok(self.drive(writer, steps, Vec::new(), 0, 1, &analysis)),
                Err(err) => Ok(ExecutionResult::failed(
                    execution_id,
                    format!("open wal: {err}"),
                    Vec::new(),
                    0,
                )),
            },
            RecoveryDecision::Complete => Ok(completed_result(&path, steps, &analysis)),
            RecoveryDecision::Abort => {
                info!(reason = %analysis.reason, "refusing to run aborted execution");
                let mut result =
                    ExecutionResult::failed(execution_id, analysis.reason.clone(), Vec::new(), 0);
                result.decision = Some(RecoveryDecision::Abort);
                Ok(result)
            }
            RecoveryDecision::Resume => self.resume(&path, execution_id, steps, &analysis),
        }
    }

    fn resume(
        &self,
        path: &Path,
        execution_id: &str,
        steps: &[StepSpec],
        analysis: &RecoveryAnalysis,
    ) -> Result<ExecutionResult> {
        let resume_from = analysis.can_resume_from;
        let (outputs, retries) = match WalReader::open(path, false) {
            Ok(reader) => committed_outputs(&reader),
            Err(err) => {
                return Ok(ExecutionResult::failed(
                    execution_id,
                    format!("reload wal: {err}"),
                    Vec::new(),
                    0,
                ));
            }
        };
        let writer = match WalWriter::resume(path, execution_id) {
            Ok(writer) => writer,
            Err(err) => {
                return Ok(ExecutionResult::failed(
                    execution_id,
                    format!("resume wal: {err}"),
                    outputs,
                    retries,
                ));
            }
        };

        if let Some(mismatch) =
            committed_mismatch(execution_id, steps, &writer.state().committed_steps)
        {
            warn!(%mismatch, "refusing to resume a different workflow");
            let mut result = ExecutionResult::failed(execution_id, mismatch, outputs, retries);
            result.decision = Some(RecoveryDecision::Resume);
            return Ok(result);
        }

        info!(
            resume_from,
            pending = ?analysis.pending_step_id,
            "resuming execution"
        );
        Ok(self.drive(writer, steps, outputs, retries, resume_from, analysis))
    }

    /// Run every step at or after `resume_from`, then finalize.
    fn drive(
        &self,
        mut writer: WalWriter,
        steps: &[StepSpec],
        mut outputs: Vec<Value>,
        mut retries: u32,
        resume_from: u32,
        analysis: &RecoveryAnalysis,
    ) -> ExecutionResult {
        let execution_id = writer.execution_id().to_string();
        let decision =
            (analysis.decision != RecoveryDecision::NotFound).then_some(analysis.decision);
        let resumed_from = decision.map(|_| resume_from);

        for (index, step) in steps.iter().enumerate() {
            let order = index as u32 + 1;
            if order < resume_from {
                debug!(order, intent = %step.intent, "skipping committed step");
                continue;
            }
            let tool = match self.registry.get(&step.tool_name) {
                Ok(tool) => tool,
                Err(err) => {
                    return self.abort(&mut writer, err.to_string(), outputs, retries, decision);
                }
            };
            match self.run_step(&mut writer, step, order, tool) {
                Ok((output, step_retries)) => {
                    outputs.push(output);
                    retries += step_retries;
                }
                Err(failure) => {
                    retries += failure.retries;
                    let reason =
                        format!("step {order} ({}) failed: {}", step.intent, failure.message);
                    return self.abort(&mut writer, reason, outputs, retries, decision);
                }
            }
        }

        let fingerprint = match writer.finalize() {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                let mut result = ExecutionResult::failed(
                    &execution_id,
                    format!("finalize wal: {err}"),
                    outputs,
                    retries,
                );
                result.decision = decision;
                return result;
            }
        };
        if let Err(err) = writer.close() {
            warn!(err = %err, "failed to close wal after completion");
        }
        ExecutionResult {
            execution_id,
            success: true,
            error: None,
            outputs,
            retry_count: retries,
            fingerprint: Some(fingerprint),
            decision,
            resumed_from,
        }
    }

    /// Log-before-execute, retry with backoff, commit-after-success.
    fn run_step(
        &self,
        writer: &mut WalWriter,
        step: &StepSpec,
        order: u32,
        tool: &dyn Tool,
    ) -> Result<(Value, u32), StepFailure> {
        let schema = tool.schema();
        let class = schema.side_effect_class;
        let max_retries = if class.is_state_changing() {
            0
        } else {
            schema.max_retries.min(self.config.max_retries)
        };
        let timeout_ms = if schema.timeout_ms == 0 {
            self.config.default_timeout_ms
        } else {
            schema.timeout_ms
        };

        let mut retry_count = 0u32;
        let mut last_reason: Option<RetryReason> = None;
        loop {
            let started = writer
                .log_step_started(StepStart {
                    intent: &step.intent,
                    tool_name: &step.tool_name,
                    params: &step.params,
                    side_effect_class: class,
                    timeout_ms,
                    execution_order: order,
                })
                .map_err(|err| StepFailure::wal(err, retry_count))?;
            let step_id = started.step_id.unwrap_or_default();

            let clock = Instant::now();
            let outcome = tool.execute(&step.params);
            let elapsed_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
            let outcome = match outcome {
                Ok(_) if elapsed_ms > timeout_ms => Err(ToolError::new(
                    RetryReason::Timeout,
                    !class.is_state_changing(),
                    format!("took {elapsed_ms}ms, limit {timeout_ms}ms"),
                )),
                other => other,
            };

            let err = match outcome {
                Ok(output) => {
                    let entry = writer
                        .commit_step(&step_id, &output, retry_count, last_reason)
                        .map_err(|err| StepFailure::wal(err, retry_count))?;
                    writer.add_to_fingerprint(&entry);
                    debug!(order, retry_count, elapsed_ms, "step succeeded");
                    return Ok((output, retry_count));
                }
                Err(err) => err,
            };

            let recoverable = err.recoverable && !class.is_state_changing();
            writer
                .log_step_failed(&step_id, &err.message, Some(err.reason), recoverable)
                .map_err(|err| StepFailure::wal(err, retry_count))?;

            let retry = recoverable
                && err.reason.is_retryable()
                && retry_count < max_retries
                && !self.recovery.should_abort_retry(retry_count, Some(err.reason));
            if !retry {
                warn!(
                    order,
                    reason = %err.reason,
                    retry_count,
                    class = %class,
                    "step failed permanently"
                );
                return Err(StepFailure {
                    message: err.to_string(),
                    retries: retry_count,
                });
            }

            let delay = backoff(retry_count, self.config.backoff_cap_secs);
            info!(
                order,
                reason = %err.reason,
                retry_count,
                delay_secs = delay.as_secs(),
                "retrying step"
            );
            self.sleeper.sleep(delay);
            retry_count += 1;
            last_reason = Some(err.reason);
        }
    }

    fn abort(
        &self,
        writer: &mut WalWriter,
        reason: String,
        outputs: Vec<Value>,
        retries: u32,
        decision: Option<RecoveryDecision>,
    ) -> ExecutionResult {
        if let Err(err) = writer.abort(&reason) {
            warn!(err = %err, "failed to record abort in wal");
        }
        let mut result =
            ExecutionResult::failed(writer.execution_id(), reason, outputs, retries);
        result.decision = decision;
        result
    }
}

/// First committed step that differs from the requested one, as an error.
///
/// Committed step ids must be a prefix of the ids derived from `steps`.
fn committed_mismatch(
    execution_id: &str,
    steps: &[StepSpec],
    committed: &[String],
) -> Option<String> {
    committed.iter().enumerate().find_map(|(index, committed_id)| {
        let order = index as u32 + 1;
        let expected = steps
            .get(index)
            .map(|step| step_id(execution_id, order, &step.intent, &step.tool_name));
        (expected.as_deref() != Some(committed_id.as_str()))
            .then(|| format!("step {order} does not match the committed step {committed_id}"))
    })
}

/// Result for an execution whose WAL already ends in `execution.completed`.
///
/// The recorded run must be exactly the requested steps.
fn completed_result(
    path: &Path,
    steps: &[StepSpec],
    analysis: &RecoveryAnalysis,
) -> ExecutionResult {
    let execution_id = analysis.execution_id.as_str();
    let reader = match WalReader::open(path, false) {
        Ok(reader) => reader,
        Err(err) => {
            let error = format!("reload wal: {err}");
            return ExecutionResult::failed(execution_id, error, Vec::new(), 0);
        }
    };
    let committed = reader.reconstruct_state().committed_steps;
    let mismatch = committed_mismatch(execution_id, steps, &committed).or_else(|| {
        (committed.len() != steps.len()).then(|| {
            format!(
                "completed execution recorded {} steps, {} requested",
                committed.len(),
                steps.len()
            )
        })
    });
    if let Some(mismatch) = mismatch {
        warn!(execution_id, %mismatch, "completed execution does not match the request");
        let mut result = ExecutionResult::failed(execution_id, mismatch, Vec::new(), 0);
        result.decision = Some(RecoveryDecision::Complete);
        return result;
    }
    let (outputs, retries) = committed_outputs(&reader);
    info!(execution_id, steps = outputs.len(), "execution already complete");
    ExecutionResult {
        execution_id: execution_id.to_string(),
        success: true,
        error: None,
        outputs,
        retry_count: retries,
        fingerprint: reader.get_fingerprint().map(str::to_string),
        decision: Some(RecoveryDecision::Complete),
        resumed_from: None,
    }
}

/// Output snapshots and retry counts of committed steps, in log order.
fn committed_outputs(reader: &WalReader) -> (Vec<Value>, u32) {
    let committed = reader
        .entries()
        .iter()
        .filter(|entry| entry.entry_type == EntryType::StepCommitted);
    let mut outputs = Vec::new();
    let mut retries = 0;
    for entry in committed {
        outputs.push(entry.output_snapshot.clone().unwrap_or(Value::Null));
        retries += entry.retry_count.unwrap_or(0);
    }
    (outputs, retries)
}
