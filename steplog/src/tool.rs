//! Tool abstraction and the explicit registry the executor resolves names in.
//!
//! A [`Tool`] is any synchronous side-effecting operation with a static
//! [`ToolSchema`]. The schema's invariants are enforced once, when the tool is
//! registered, so call sites can trust them.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::core::types::{RetryReason, SideEffectClass};
use crate::error::RegistryError;

/// Static description of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub side_effect_class: SideEffectClass,
    /// Per-call timeout; 0 means "use the runtime default".
    pub timeout_ms: u64,
    /// Retry budget; must be 0 for STATE_CHANGING tools.
    pub max_retries: u32,
}

impl ToolSchema {
    pub fn new(name: &str, side_effect_class: SideEffectClass) -> Self {
        Self {
            name: name.to_string(),
            side_effect_class,
            timeout_ms: 0,
            max_retries: 0,
        }
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.side_effect_class.is_state_changing() && self.max_retries != 0 {
            return Err(RegistryError::RetryingStateChanging {
                name: self.name.clone(),
                max_retries: self.max_retries,
            });
        }
        Ok(())
    }
}

/// Failure reported by a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {message}")]
pub struct ToolError {
    pub reason: RetryReason,
    /// Whether another attempt could succeed.
    pub recoverable: bool,
    pub message: String,
}

impl ToolError {
    pub fn new(reason: RetryReason, recoverable: bool, message: impl Into<String>) -> Self {
        Self {
            reason,
            recoverable,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RetryReason::Timeout, true, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RetryReason::NetworkError, true, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(RetryReason::RateLimited, true, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(RetryReason::RuntimeError, false, message)
    }

    pub fn malformed_output(message: impl Into<String>) -> Self {
        Self::new(RetryReason::MalformedOutput, false, message)
    }

    /// Recoverable and of a kind that is ever retried.
    pub fn is_retryable(&self) -> bool {
        self.recoverable && self.reason.is_retryable()
    }
}

/// A side-effecting operation the executor can run as a step.
pub trait Tool {
    fn schema(&self) -> &ToolSchema;

    fn execute(&self, params: &Value) -> Result<Value, ToolError>;
}

/// Name-indexed set of tools, built explicitly and passed by reference.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Rc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `tool`, rejecting duplicate names and invalid schemas.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_rc(Rc::new(tool))
    }

    pub fn register_rc(&mut self, tool: Rc<dyn Tool>) -> Result<(), RegistryError> {
        let schema = tool.schema();
        schema.validate()?;
        if self.tools.contains_key(&schema.name) {
            return Err(RegistryError::DuplicateTool(schema.name.clone()));
        }
        debug!(
            tool = %schema.name,
            side_effect = %schema.side_effect_class,
            max_retries = schema.max_retries,
            "tool registered"
        );
        let name = schema.name.clone();
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn Tool, RegistryError> {
        self.tools
            .get(name)
            .map(|tool| tool.as_ref())
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(ToolSchema);

    impl Tool for Echo {
        fn schema(&self) -> &ToolSchema {
            &self.0
        }

        fn execute(&self, params: &Value) -> Result<Value, ToolError> {
            Ok(params.clone())
        }
    }

    #[test]
    fn registers_and_resolves_by_name() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Echo(ToolSchema::new("b_echo", SideEffectClass::ReadOnly)))
            .expect("register");
        registry
            .register(Echo(ToolSchema::new("a_echo", SideEffectClass::External).max_retries(2)))
            .expect("register");

        assert_eq!(registry.names(), vec!["a_echo", "b_echo"]);
        let tool = registry.get("b_echo").expect("get");
        assert_eq!(tool.execute(&json!({"x": 1})).expect("exec"), json!({"x": 1}));
        assert!(matches!(
            registry.get("missing"),
            Err(RegistryError::UnknownTool(_))
        ));
    }

    #[test]
    fn rejects_duplicates() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Echo(ToolSchema::new("echo", SideEffectClass::ReadOnly)))
            .expect("register");
        let err = registry
            .register(Echo(ToolSchema::new("echo", SideEffectClass::ReadOnly)))
            .expect_err("duplicate");
        assert_eq!(err, RegistryError::DuplicateTool("echo".to_string()));
    }

    #[test]
    fn state_changing_tools_may_not_retry() {
        let mut registry = ToolRegistry::new();
        let schema = ToolSchema::new("update_db", SideEffectClass::StateChanging).max_retries(1);
        let err = registry.register(Echo(schema)).expect_err("retrying");
        assert!(err.to_string().contains("must be 0"));
        assert!(registry.is_empty());
    }

    #[test]
    fn retryable_needs_both_flag_and_reason() {
        assert!(ToolError::timeout("slow").is_retryable());
        assert!(!ToolError::runtime("boom").is_retryable());
        assert!(!ToolError::new(RetryReason::Timeout, false, "slow").is_retryable());
        assert_eq!(
            ToolError::rate_limited("429").to_string(),
            "rate_limited: 429"
        );
    }
}
