//! Retry-versus-terminate decisions for failed steps.
//!
//! Stateless: the executor tracks how many retries a step has used and asks
//! [`RetryHandler::decide`] what to do with the latest error.

use stepwise_types::execution::ExecutionError;
use stepwise_types::guardrail::GuardrailConfig;
use stepwise_types::workflow::Step;

/// What to do after a step attempt failed.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Dispatch the same step again as attempt number `next_attempt`.
    Retry { next_attempt: u32 },
    /// End the run with this error.
    Terminate(ExecutionError),
}

pub struct RetryHandler;

impl RetryHandler {
    /// Retries allowed after the first attempt for `step`.
    pub fn max_retries(step: &Step, guardrails: &GuardrailConfig) -> u32 {
        step.max_retries.unwrap_or(guardrails.max_retries_per_node)
    }

    /// Decide whether a failed attempt is retried.
    ///
    /// Only RETRIABLE errors are retried, and only while
    /// `retries_used < max_retries`. A retriable error that runs out of
    /// retries is promoted to FATAL.
    pub fn decide(error: ExecutionError, retries_used: u32, max_retries: u32) -> RetryDecision {
        if !error.is_retriable() {
            return RetryDecision::Terminate(error);
        }
        if retries_used < max_retries {
            return RetryDecision::Retry {
                next_attempt: retries_used + 2,
            };
        }
        RetryDecision::Terminate(error.promote_to_fatal(retries_used + 1))
    }
}
