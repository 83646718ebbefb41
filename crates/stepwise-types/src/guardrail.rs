//! Guardrail policy configuration and evaluation results.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::run::Severity;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Policy configuration for the guardrail engine.
///
/// Every limit is optional except the retry limits and the tool loop
/// threshold; an absent limit is never checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Master switch. When false every check returns ALLOW.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tools that may never be invoked.
    #[serde(default)]
    pub forbidden_tools: Vec<String>,

    /// Consecutive failures of one tool that trigger a loop block.
    #[serde(default = "default_tool_loop_threshold")]
    pub tool_loop_threshold: u32,

    /// Default per-tool call cap, overridden by `tools.<name>.max_calls`.
    #[serde(default)]
    pub max_tool_calls_per_tool: Option<u32>,

    /// Cumulative token budget for one run.
    #[serde(default)]
    pub max_tokens_per_run: Option<u64>,

    /// Fraction of `max_tokens_per_run` at which a WARN fires.
    #[serde(default = "default_token_warn_threshold")]
    pub token_warn_threshold: f64,

    /// Estimated tokens for a single decision above which a WARN fires.
    #[serde(default)]
    pub max_tokens_per_decision: Option<u64>,

    #[serde(default = "default_max_retries_per_node")]
    pub max_retries_per_node: u32,

    #[serde(default = "default_max_retries_per_run")]
    pub max_retries_per_run: u32,

    #[serde(default)]
    pub latency_warn_ms: Option<u64>,

    #[serde(default)]
    pub latency_max_ms: Option<u64>,

    /// Per-tool overrides keyed by tool name.
    #[serde(default)]
    pub tools: HashMap<String, ToolPolicy>,
}

/// Per-tool policy overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub forbidden: bool,
    #[serde(default)]
    pub max_calls: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_tool_loop_threshold() -> u32 {
    3
}

fn default_token_warn_threshold() -> f64 {
    0.8
}

fn default_max_retries_per_node() -> u32 {
    3
}

fn default_max_retries_per_run() -> u32 {
    10
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            forbidden_tools: Vec::new(),
            tool_loop_threshold: default_tool_loop_threshold(),
            max_tool_calls_per_tool: None,
            max_tokens_per_run: None,
            token_warn_threshold: default_token_warn_threshold(),
            max_tokens_per_decision: None,
            max_retries_per_node: default_max_retries_per_node(),
            max_retries_per_run: default_max_retries_per_run(),
            latency_warn_ms: None,
            latency_max_ms: None,
            tools: HashMap::new(),
        }
    }
}

impl GuardrailConfig {
    /// A configuration with every check switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether `tool` is denied, by name or by its per-tool policy.
    pub fn is_forbidden(&self, tool: &str) -> bool {
        self.forbidden_tools.iter().any(|t| t == tool)
            || self.tools.get(tool).is_some_and(|p| p.forbidden)
    }

    /// Effective call cap for `tool`.
    pub fn max_calls_for(&self, tool: &str) -> Option<u32> {
        self.tools
            .get(tool)
            .and_then(|p| p.max_calls)
            .or(self.max_tool_calls_per_tool)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What the guardrail engine decided for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailAction {
    Allow,
    Warn,
    Block,
}

impl fmt::Display for GuardrailAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardrailAction::Allow => write!(f, "allow"),
            GuardrailAction::Warn => write!(f, "warn"),
            GuardrailAction::Block => write!(f, "block"),
        }
    }
}

/// One policy that fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailViolation {
    /// Stable policy identifier, e.g. `"tool_forbidden"`.
    pub policy_id: String,
    pub severity: Severity,
    pub description: String,
    pub remediation: String,
    pub action: GuardrailAction,
}

/// Outcome of a `check_before` or `check_after` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub blocked: bool,
    pub action: GuardrailAction,
    pub violations: Vec<GuardrailViolation>,
}

impl GuardrailResult {
    pub fn allow() -> Self {
        Self {
            blocked: false,
            action: GuardrailAction::Allow,
            violations: Vec::new(),
        }
    }

    /// Fold violations: any BLOCK wins, otherwise any WARN, otherwise ALLOW.
    pub fn from_violations(violations: Vec<GuardrailViolation>) -> Self {
        let action = violations
            .iter()
            .map(|v| v.action)
            .max()
            .unwrap_or(GuardrailAction::Allow);
        Self {
            blocked: action == GuardrailAction::Block,
            action,
            violations,
        }
    }

    /// The first blocking violation, if any.
    pub fn blocking_violation(&self) -> Option<&GuardrailViolation> {
        self.violations
            .iter()
            .find(|v| v.action == GuardrailAction::Block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(action: GuardrailAction) -> GuardrailViolation {
        GuardrailViolation {
            policy_id: "test".to_string(),
            severity: Severity::Warning,
            description: String::new(),
            remediation: String::new(),
            action,
        }
    }

    #[test]
    fn block_wins_over_warn() {
        let result = GuardrailResult::from_violations(vec![
            violation(GuardrailAction::Warn),
            violation(GuardrailAction::Block),
        ]);
        assert!(result.blocked);
        assert_eq!(result.action, GuardrailAction::Block);
    }

    #[test]
    fn empty_violations_allow() {
        let result = GuardrailResult::from_violations(vec![]);
        assert_eq!(result, GuardrailResult::allow());
    }

    #[test]
    fn per_tool_policy_overrides() {
        let toml_str = r#"
forbidden_tools = ["shell"]
max_tool_calls_per_tool = 50

[tools.http_get]
max_calls = 5

[tools.rm]
forbidden = true
"#;
        let config: GuardrailConfig = toml::from_str(toml_str).unwrap();
        assert!(config.enabled);
        assert!(config.is_forbidden("shell"));
        assert!(config.is_forbidden("rm"));
        assert!(!config.is_forbidden("http_get"));
        assert_eq!(config.max_calls_for("http_get"), Some(5));
        assert_eq!(config.max_calls_for("search"), Some(50));
        assert_eq!(config.tool_loop_threshold, 3);
        assert_eq!(config.max_retries_per_node, 3);
        assert_eq!(config.max_retries_per_run, 10);
    }
}
