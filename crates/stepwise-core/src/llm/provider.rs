//! LlmProvider trait definition.

use stepwise_types::llm::{CompletionRequest, CompletionResponse, LlmError};

/// Trait for model-completion backends.
///
/// Must be safe to call repeatedly: the worker re-issues the same request
/// when a step is retried. `LlmError::RateLimited` and
/// `LlmError::Overloaded` are classified as retriable.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g., "anthropic", "mock").
    fn name(&self) -> &str;

    /// Send a completion request and receive the full response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;
}
