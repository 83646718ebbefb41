//! Lightweight function registry.
//!
//! Functions take a JSON argument map and return either a plain value or a
//! `{ success, outputs, error }` envelope. Both synchronous and asynchronous
//! callables can be registered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

type FunctionHandler =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// What a registered function returned.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionReturn {
    /// A plain value, stored under `result`.
    Value(Value),
    /// An explicit success/failure envelope.
    Envelope {
        success: bool,
        outputs: Map<String, Value>,
        error: Option<String>,
    },
}

impl FunctionReturn {
    /// Recognize an envelope: an object with a boolean `success` and at least
    /// one of `outputs` or `error`.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return FunctionReturn::Value(value);
        };
        let is_envelope = map.get("success").is_some_and(Value::is_boolean)
            && (map.contains_key("outputs") || map.contains_key("error"));
        if !is_envelope {
            return FunctionReturn::Value(Value::Object(map));
        }

        let success = map.get("success").and_then(Value::as_bool).unwrap_or(false);
        let outputs = match map.remove("outputs") {
            Some(Value::Object(outputs)) => outputs,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                let mut wrapped = Map::new();
                wrapped.insert("result".to_string(), other);
                wrapped
            }
        };
        let error = match map.remove("error") {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        FunctionReturn::Envelope {
            success,
            outputs,
            error,
        }
    }
}

/// Named callables for function steps and lightweight tools.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionHandler>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asynchronous function.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.functions
            .insert(name.into(), Arc::new(move |args| function(args).boxed()));
    }

    /// Register a synchronous function.
    pub fn register_sync<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let function = Arc::new(function);
        self.functions.insert(
            name.into(),
            Arc::new(move |args| {
                let function = Arc::clone(&function);
                async move { function(args) }.boxed()
            }),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Call a function by name. `None` when no such function is registered.
    pub async fn call(&self, name: &str, args: Map<String, Value>) -> Option<anyhow::Result<FunctionReturn>> {
        let function = self.functions.get(name)?;
        Some(function(args).await.map(FunctionReturn::from_value))
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}
