//! Guardrail policy engine.
//!
//! `GuardrailEngine` is stateless: every check reads a [`GuardrailConfig`]
//! and a per-run [`RunCounters`] value owned by the executor. Counters are
//! never shared between runs.
//!
//! Pre-decision policies run in a fixed order and the first BLOCK ends the
//! evaluation:
//!
//! 1. `tool_forbidden`
//! 2. `tool_loop` (first attempts only; re-attempts fall under the retry limits)
//! 3. `tool_call_limit`
//! 4. `token_run_budget`
//! 5. `token_decision_limit` (WARN only)
//! 6. `retry_limit_node` / `retry_limit_run` (retries only)

use std::collections::HashMap;

use stepwise_types::guardrail::{
    GuardrailAction, GuardrailConfig, GuardrailResult, GuardrailViolation,
};
use stepwise_types::run::Severity;

// ---------------------------------------------------------------------------
// Counters and inputs
// ---------------------------------------------------------------------------

/// Per-run counters read by the guardrail engine.
///
/// Only the executor and the guardrail engine touch these.
#[derive(Debug, Clone, Default)]
pub struct RunCounters {
    pub tool_calls: HashMap<String, u32>,
    pub tool_failure_streak: HashMap<String, u32>,
    pub total_tokens: u64,
    pub node_retries: HashMap<String, u32>,
    pub run_retries: u32,
}

impl RunCounters {
    pub fn record_tool_call(&mut self, tool: &str) {
        *self.tool_calls.entry(tool.to_string()).or_default() += 1;
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.total_tokens += tokens;
    }

    pub fn record_retry(&mut self, node_id: &str) {
        *self.node_retries.entry(node_id.to_string()).or_default() += 1;
        self.run_retries += 1;
    }

    pub fn retries_for(&self, node_id: &str) -> u32 {
        self.node_retries.get(node_id).copied().unwrap_or(0)
    }
}

/// What the executor is about to do.
#[derive(Debug, Clone)]
pub struct DecisionPlan {
    pub node_id: String,
    pub tool_name: Option<String>,
    pub estimated_tokens: u64,
    /// The dispatch re-attempts a failed step.
    pub is_retry: bool,
}

/// What happened after a dispatch.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub node_id: String,
    pub tool_name: Option<String>,
    pub success: bool,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// GuardrailEngine
// ---------------------------------------------------------------------------

/// Stateless policy evaluator.
#[derive(Debug, Clone, Default)]
pub struct GuardrailEngine {
    config: GuardrailConfig,
}

impl GuardrailEngine {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Evaluate the pre-decision policies.
    pub fn check_before(&self, plan: &DecisionPlan, counters: &RunCounters) -> GuardrailResult {
        if !self.config.enabled {
            return GuardrailResult::allow();
        }

        let mut violations = Vec::new();
        let checks: [fn(&Self, &DecisionPlan, &RunCounters) -> Option<GuardrailViolation>; 6] = [
            Self::check_tool_forbidden,
            Self::check_tool_loop,
            Self::check_tool_call_limit,
            Self::check_token_run_budget,
            Self::check_token_decision_limit,
            Self::check_retry_limits,
        ];
        for check in checks {
            if let Some(violation) = check(self, plan, counters) {
                let blocking = violation.action == GuardrailAction::Block;
                violations.push(violation);
                if blocking {
                    break;
                }
            }
        }

        let result = GuardrailResult::from_violations(violations);
        log_result(&plan.node_id, &result);
        result
    }

    /// Evaluate the post-decision policies and update the tool failure streak.
    ///
    /// Never blocks: a decision that already ran can only be reported.
    pub fn check_after(&self, outcome: &DecisionOutcome, counters: &mut RunCounters) -> GuardrailResult {
        if !self.config.enabled {
            return GuardrailResult::allow();
        }

        if let Some(tool) = &outcome.tool_name {
            let streak = counters.tool_failure_streak.entry(tool.clone()).or_default();
            if outcome.success {
                *streak = 0;
            } else {
                *streak += 1;
            }
        }

        let mut violations = Vec::new();
        let latency = outcome.latency_ms;
        if let Some(max) = self.config.latency_max_ms.filter(|max| latency >= *max) {
            violations.push(violation(
                "latency",
                Severity::Critical,
                format!("step '{}' took {latency}ms, above the {max}ms maximum", outcome.node_id),
                "raise latency_max_ms or split the step",
                GuardrailAction::Warn,
            ));
        } else if let Some(warn) = self.config.latency_warn_ms.filter(|warn| latency >= *warn) {
            violations.push(violation(
                "latency",
                Severity::Warning,
                format!("step '{}' took {latency}ms, above the {warn}ms warning level", outcome.node_id),
                "check the collaborator's responsiveness",
                GuardrailAction::Warn,
            ));
        }

        let result = GuardrailResult::from_violations(violations);
        log_result(&outcome.node_id, &result);
        result
    }

    // -----------------------------------------------------------------------
    // Pre-decision policies
    // -----------------------------------------------------------------------

    fn check_tool_forbidden(&self, plan: &DecisionPlan, _: &RunCounters) -> Option<GuardrailViolation> {
        let tool = plan.tool_name.as_deref()?;
        self.config.is_forbidden(tool).then(|| {
            violation(
                "tool_forbidden",
                Severity::Critical,
                format!("tool '{tool}' is forbidden"),
                "remove the tool from the workflow or from the deny list",
                GuardrailAction::Block,
            )
        })
    }

    fn check_tool_loop(&self, plan: &DecisionPlan, counters: &RunCounters) -> Option<GuardrailViolation> {
        if plan.is_retry {
            return None;
        }
        let tool = plan.tool_name.as_deref()?;
        let streak = counters.tool_failure_streak.get(tool).copied().unwrap_or(0);
        (streak >= self.config.tool_loop_threshold).then(|| {
            violation(
                "tool_loop",
                Severity::Critical,
                format!("tool '{tool}' failed {streak} times in a row"),
                "fix the tool input or route around the tool",
                GuardrailAction::Block,
            )
        })
    }

    fn check_tool_call_limit(&self, plan: &DecisionPlan, counters: &RunCounters) -> Option<GuardrailViolation> {
        let tool = plan.tool_name.as_deref()?;
        let max = self.config.max_calls_for(tool)?;
        let calls = counters.tool_calls.get(tool).copied().unwrap_or(0);
        (calls >= max).then(|| {
            violation(
                "tool_call_limit",
                Severity::Critical,
                format!("tool '{tool}' reached its call limit ({calls}/{max})"),
                "raise the per-tool max_calls",
                GuardrailAction::Block,
            )
        })
    }

    fn check_token_run_budget(&self, plan: &DecisionPlan, counters: &RunCounters) -> Option<GuardrailViolation> {
        let max = self.config.max_tokens_per_run?;
        let projected = counters.total_tokens + plan.estimated_tokens;
        if projected >= max {
            return Some(violation(
                "token_run_budget",
                Severity::Critical,
                format!("projected run tokens {projected} reach the budget of {max}"),
                "raise max_tokens_per_run or shorten prompts",
                GuardrailAction::Block,
            ));
        }
        // Compare the ratio: `max * threshold` can round above an exact integer.
        let used = projected as f64 / max as f64;
        (used >= self.config.token_warn_threshold).then(|| {
            violation(
                "token_run_budget",
                Severity::Warning,
                format!(
                    "projected run tokens {projected} passed {:.0}% of the budget of {max}",
                    self.config.token_warn_threshold * 100.0
                ),
                "the run is close to its token budget",
                GuardrailAction::Warn,
            )
        })
    }

    fn check_token_decision_limit(&self, plan: &DecisionPlan, _: &RunCounters) -> Option<GuardrailViolation> {
        let max = self.config.max_tokens_per_decision?;
        (plan.estimated_tokens >= max).then(|| {
            violation(
                "token_decision_limit",
                Severity::Warning,
                format!(
                    "step '{}' estimates {} tokens, above the per-decision limit of {max}",
                    plan.node_id, plan.estimated_tokens
                ),
                "split the step into smaller requests",
                GuardrailAction::Warn,
            )
        })
    }

    fn check_retry_limits(&self, plan: &DecisionPlan, counters: &RunCounters) -> Option<GuardrailViolation> {
        if !plan.is_retry {
            return None;
        }
        let node_retries = counters.retries_for(&plan.node_id);
        if node_retries >= self.config.max_retries_per_node {
            return Some(violation(
                "retry_limit_node",
                Severity::Critical,
                format!(
                    "step '{}' already retried {node_retries} times (max {})",
                    plan.node_id, self.config.max_retries_per_node
                ),
                "fix the underlying failure before retrying",
                GuardrailAction::Block,
            ));
        }
        (counters.run_retries >= self.config.max_retries_per_run).then(|| {
            violation(
                "retry_limit_run",
                Severity::Critical,
                format!(
                    "run already retried {} times (max {})",
                    counters.run_retries, self.config.max_retries_per_run
                ),
                "the run is unstable; inspect earlier failures",
                GuardrailAction::Block,
            )
        })
    }
}

fn violation(
    policy_id: &str,
    severity: Severity,
    description: String,
    remediation: &str,
    action: GuardrailAction,
) -> GuardrailViolation {
    GuardrailViolation {
        policy_id: policy_id.to_string(),
        severity,
        description,
        remediation: remediation.to_string(),
        action,
    }
}

fn log_result(node_id: &str, result: &GuardrailResult) {
    for v in &result.violations {
        match v.action {
            GuardrailAction::Block => {
                tracing::warn!(node_id, policy = %v.policy_id, "guardrail blocked: {}", v.description)
            }
            GuardrailAction::Warn => {
                tracing::warn!(node_id, policy = %v.policy_id, "guardrail warning: {}", v.description)
            }
            GuardrailAction::Allow => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
