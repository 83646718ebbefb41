//! The tool execution seam.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::llm::ToolDefinition;

/// Result of a tool call.
///
/// `is_error = true` is a soft failure: the tool ran and reported a problem,
/// which the executor routes instead of treating as a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Value::String(content.into()),
            is_error: false,
        }
    }

    pub fn json(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Value::String(message.into()),
            is_error: true,
        }
    }

    /// The content as structured data: JSON values as-is, strings parsed when
    /// they hold a JSON object.
    pub fn structured(&self) -> Option<serde_json::Map<String, Value>> {
        match &self.content {
            Value::Object(map) => Some(map.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Executes a named tool with structured input.
///
/// Faults (`Err`) are classified by the worker; `Ok` with `is_error` set is
/// a reported tool failure.
pub trait ToolExecutor: Send + Sync {
    fn execute<'a>(&'a self, tool_name: &'a str, input: Value) -> BoxFuture<'a, anyhow::Result<ToolOutput>>;

    /// Definitions advertised to model calls that list these tools.
    fn definitions(&self, _names: &[String]) -> Vec<ToolDefinition> {
        Vec::new()
    }
}
