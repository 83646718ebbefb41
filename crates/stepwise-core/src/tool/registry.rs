//! Formal tool registry: named tools with a definition and an async handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_types::llm::ToolDefinition;

use super::executor::{ToolExecutor, ToolOutput};
use crate::workflow::classify::Fault;

type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<ToolOutput>> + Send + Sync>;

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

/// Tools available to tool-use steps and advertised to model calls.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration under the same name replaces the earlier one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, definition: ToolDefinition, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ToolOutput>> + Send + 'static,
    {
        let name = name.into();
        let handler: ToolHandler = Arc::new(move |input| handler(input).boxed());
        if self
            .tools
            .insert(name.clone(), RegisteredTool { definition, handler })
            .is_some()
        {
            tracing::debug!(tool = %name, "tool registration replaced");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolExecutor for ToolRegistry {
    fn execute<'a>(&'a self, tool_name: &'a str, input: Value) -> BoxFuture<'a, anyhow::Result<ToolOutput>> {
        Box::pin(async move {
            let Some(tool) = self.tools.get(tool_name) else {
                return Err(Fault::MissingKey(format!("tool '{tool_name}' is not registered")).into());
            };
            (tool.handler)(input).await
        })
    }

    /// Definitions for the named tools, skipping unknown names.
    fn definitions(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| {
                let found = self.tools.get(name).map(|t| t.definition.clone());
                if found.is_none() {
                    tracing::warn!(tool = %name, "model call advertises an unregistered tool");
                }
                found
            })
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}
