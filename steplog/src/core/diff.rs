//! Field-by-field comparison of two replayed executions.
//!
//! Every discrepancy becomes a [`Drift`] tagged with a [`DriftKind`]. Side
//! effect drift is critical: [`evaluate`] fails it before any tolerance is
//! applied.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::replay::{ReplayExecution, ReplayStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    Intent,
    Tool,
    Param,
    Execution,
    Output,
    Retry,
    Timeout,
    SideEffect,
}

impl DriftKind {
    pub fn is_critical(self) -> bool {
        self == DriftKind::SideEffect
    }
}

/// One recorded discrepancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Drift {
    pub kind: DriftKind,
    pub expected: Value,
    pub actual: Value,
    /// Step id in the expected run; `None` for execution-level drift.
    pub step_id: Option<String>,
    pub execution_order: Option<u32>,
    pub is_critical: bool,
}

impl Drift {
    fn new(kind: DriftKind, expected: Value, actual: Value, step: Option<&ReplayStep>) -> Self {
        Self {
            kind,
            expected,
            actual,
            step_id: step.map(|s| s.step_id.clone()),
            execution_order: step.map(|s| s.execution_order),
            is_critical: kind.is_critical(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffResult {
    #[serde(rename = "match")]
    pub is_match: bool,
    pub has_critical_drift: bool,
    pub expected_steps: usize,
    pub actual_steps: usize,
    pub drifts: Vec<Drift>,
}

impl DiffResult {
    pub fn drifts_of(&self, kind: DriftKind) -> impl Iterator<Item = &Drift> {
        self.drifts.iter().filter(move |drift| drift.kind == kind)
    }
}

/// Compare `actual` against `expected`.
pub fn diff(expected: &ReplayExecution, actual: &ReplayExecution) -> DiffResult {
    let mut drifts = Vec::new();

    if expected.steps.len() != actual.steps.len() {
        drifts.push(Drift::new(
            DriftKind::Execution,
            json!({ "step_count": expected.steps.len() }),
            json!({ "step_count": actual.steps.len() }),
            None,
        ));
    }

    for (exp, act) in expected.steps.iter().zip(&actual.steps) {
        compare_steps(exp, act, &mut drifts);
    }

    if expected.fingerprint != actual.fingerprint {
        drifts.push(Drift::new(
            DriftKind::Execution,
            json!({ "fingerprint": expected.fingerprint }),
            json!({ "fingerprint": actual.fingerprint }),
            None,
        ));
    }
    if expected.completed != actual.completed || expected.aborted != actual.aborted {
        drifts.push(Drift::new(
            DriftKind::Execution,
            json!({ "completed": expected.completed, "aborted": expected.aborted }),
            json!({ "completed": actual.completed, "aborted": actual.aborted }),
            None,
        ));
    }

    let has_critical_drift = drifts.iter().any(|drift| drift.is_critical);
    DiffResult {
        is_match: drifts.is_empty(),
        has_critical_drift,
        expected_steps: expected.steps.len(),
        actual_steps: actual.steps.len(),
        drifts,
    }
}

fn compare_steps(exp: &ReplayStep, act: &ReplayStep, drifts: &mut Vec<Drift>) {
    let mut check = |kind: DriftKind, expected: Value, actual: Value| {
        if expected != actual {
            drifts.push(Drift::new(kind, expected, actual, Some(exp)));
        }
    };

    check(DriftKind::Intent, json!(exp.intent), json!(act.intent));
    check(DriftKind::Tool, json!(exp.tool_name), json!(act.tool_name));
    check(DriftKind::Param, json!(exp.params_hash), json!(act.params_hash));
    check(
        DriftKind::Execution,
        json!(exp.execution_order),
        json!(act.execution_order),
    );
    check(
        DriftKind::SideEffect,
        json!(exp.side_effect_class),
        json!(act.side_effect_class),
    );
    check(DriftKind::Output, json!(exp.output_hash), json!(act.output_hash));
    check(
        DriftKind::Retry,
        json!([exp.retry_count, exp.retry_reason]),
        json!([act.retry_count, act.retry_reason]),
    );
    check(
        DriftKind::Timeout,
        json!([exp.timeout_ms, exp.did_timeout]),
        json!([act.timeout_ms, act.did_timeout]),
    );
}

/// Tolerance layered on top of a diff (e.g. by an evaluation harness).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftPolicy {
    /// Non-critical drifts tolerated before failing.
    pub max_drifts: usize,
    /// Kinds that never count against `max_drifts`.
    pub ignored_kinds: BTreeSet<DriftKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass { tolerated: usize },
    Fail { reason: String },
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass { .. })
    }
}

/// Apply `policy` to `result`. Critical drift fails unconditionally.
pub fn evaluate(result: &DiffResult, policy: &DriftPolicy) -> Verdict {
    if result.has_critical_drift {
        let steps: Vec<String> = result
            .drifts
            .iter()
            .filter(|drift| drift.is_critical)
            .filter_map(|drift| drift.step_id.clone())
            .collect();
        return Verdict::Fail {
            reason: format!("side_effect drift on steps [{}]", steps.join(", ")),
        };
    }

    let counted = result
        .drifts
        .iter()
        .filter(|drift| !policy.ignored_kinds.contains(&drift.kind))
        .count();
    if counted > policy.max_drifts {
        return Verdict::Fail {
            reason: format!(
                "{counted} drifts exceed tolerance of {}",
                policy.max_drifts
            ),
        };
    }
    Verdict::Pass { tolerated: counted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RetryReason, SideEffectClass};

    fn step(order: u32, output: &str) -> ReplayStep {
        ReplayStep {
            step_id: format!("s{order}"),
            execution_order: order,
            intent: "fetch".to_string(),
            tool_name: "fetch_context".to_string(),
            params_hash: "p".to_string(),
            params_snapshot: None,
            side_effect_class: Some(SideEffectClass::ReadOnly),
            output_hash: Some(output.to_string()),
            output_snapshot: None,
            retry_count: 0,
            retry_reason: None,
            timeout_ms: 1000,
            did_timeout: false,
            committed: true,
            deterministic_hash: None,
        }
    }

    fn run(steps: Vec<ReplayStep>) -> ReplayExecution {
        ReplayExecution {
            execution_id: "e".to_string(),
            steps,
            completed: true,
            aborted: false,
            abort_reason: None,
            fingerprint: Some("fp".to_string()),
        }
    }

    #[test]
    fn identical_runs_match() {
        let result = diff(&run(vec![step(1, "o1")]), &run(vec![step(1, "o1")]));
        assert!(result.is_match);
        assert!(!result.has_critical_drift);
        assert_eq!(evaluate(&result, &DriftPolicy::default()), Verdict::Pass { tolerated: 0 });
    }

    #[test]
    fn each_dimension_is_reported_once() {
        let expected = run(vec![step(1, "o1")]);
        let mut changed = step(1, "o2");
        changed.intent = "other".to_string();
        changed.retry_count = 1;
        changed.retry_reason = Some(RetryReason::Timeout);
        changed.did_timeout = true;
        let actual = run(vec![changed]);

        let result = diff(&expected, &actual);
        assert!(!result.is_match);
        assert_eq!(result.drifts_of(DriftKind::Intent).count(), 1);
        assert_eq!(result.drifts_of(DriftKind::Output).count(), 1);
        assert_eq!(result.drifts_of(DriftKind::Retry).count(), 1);
        assert_eq!(result.drifts_of(DriftKind::Timeout).count(), 1);
        assert_eq!(result.drifts_of(DriftKind::Tool).count(), 0);
        assert_eq!(result.drifts[0].step_id.as_deref(), Some("s1"));
    }

    #[test]
    fn step_count_and_fingerprint_are_execution_drift() {
        let expected = run(vec![step(1, "o1"), step(2, "o2")]);
        let mut actual = run(vec![step(1, "o1")]);
        actual.fingerprint = Some("other".to_string());
        let result = diff(&expected, &actual);
        assert_eq!(result.drifts_of(DriftKind::Execution).count(), 2);
        assert!(result.drifts.iter().all(|d| d.step_id.is_none()));
    }

    #[test]
    fn side_effect_drift_fails_even_with_loose_policy() {
        let expected = run(vec![step(1, "o1")]);
        let mut changed = step(1, "o1");
        changed.side_effect_class = Some(SideEffectClass::StateChanging);
        let result = diff(&expected, &run(vec![changed]));
        assert!(result.has_critical_drift);

        let loose = DriftPolicy {
            max_drifts: 100,
            ignored_kinds: [DriftKind::SideEffect].into_iter().collect(),
        };
        let verdict = evaluate(&result, &loose);
        assert!(!verdict.passed());
    }

    #[test]
    fn tolerance_absorbs_non_critical_drift() {
        let expected = run(vec![step(1, "o1")]);
        let actual = run(vec![step(1, "o2")]);
        let result = diff(&expected, &actual);
        assert!(!evaluate(&result, &DriftPolicy::default()).passed());

        let policy = DriftPolicy {
            max_drifts: 1,
            ignored_kinds: BTreeSet::new(),
        };
        assert_eq!(evaluate(&result, &policy), Verdict::Pass { tolerated: 1 });
    }
}
