//! Per-run shared memory with reference resolution and size limits.
//!
//! `SharedMemory` is the key/value context steps read inputs from and write
//! outputs to. It is owned by the executor and lent to the worker for the
//! duration of one step. Keys may be addressed with dot paths
//! (`summary.words`, `items.0`).

use serde_json::{Map, Value, json};
use stepwise_types::execution::{ErrorKind, ExecutionError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single step output (1 MiB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum serialized size of the whole memory (10 MiB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// SharedMemory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedMemory {
    data: Map<String, Value>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed memory from a run input. Non-object inputs are stored under `input`.
    pub fn from_input(input: &Value) -> Self {
        match input {
            Value::Object(map) => Self { data: map.clone() },
            Value::Null => Self::default(),
            other => {
                let mut data = Map::new();
                data.insert("input".to_string(), other.clone());
                Self { data }
            }
        }
    }

    /// Restore memory from a checkpoint snapshot.
    pub fn from_json(value: Value) -> Result<Self, ExecutionError> {
        match value {
            Value::Object(data) => Ok(Self { data }),
            Value::Null => Ok(Self::default()),
            other => Err(ExecutionError::new(
                ErrorKind::InvalidConfiguration,
                format!("memory snapshot must be an object, got {other}"),
            )),
        }
    }

    /// Snapshot for checkpoints and expression contexts.
    pub fn to_json(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Look up a key or dot path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.data.get(path) {
            return Some(value);
        }
        lookup_path(&self.data, path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Set a top-level key, enforcing the total size limit.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ExecutionError> {
        self.data.insert(key.to_string(), value);
        self.check_total_size()
    }

    /// Store one step output under `key`.
    ///
    /// Outputs larger than [`MAX_STEP_OUTPUT_SIZE`] are replaced by a
    /// truncation marker. Exceeding [`MAX_CONTEXT_SIZE`] is an
    /// `OUT_OF_MEMORY` error; the oversized value stays written so the
    /// caller can inspect it.
    pub fn write_output(&mut self, step_id: &str, key: &str, value: Value) -> Result<(), ExecutionError> {
        let size = serialized_size(&value);
        let value = if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                key,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
            })
        } else {
            value
        };
        self.set(key, value)
    }

    /// Copy `memory[source]` into `memory[target]`. Returns whether a value was copied.
    pub fn copy_key(&mut self, source: &str, target: &str) -> Result<bool, ExecutionError> {
        match self.get(source).cloned() {
            Some(value) => {
                self.set(target, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Serialized size of the whole memory in bytes.
    pub fn total_size(&self) -> usize {
        self.data.values().map(serialized_size).sum()
    }

    fn check_total_size(&self) -> Result<(), ExecutionError> {
        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ExecutionError::new(
                ErrorKind::OutOfMemory,
                format!("shared memory size ({total} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"),
            )
            .with_context("memory_bytes", total as u64));
        }
        Ok(())
    }

    /// Resolve references inside a value.
    ///
    /// A string that starts with `marker` is replaced by the memory value at
    /// the path that follows it; a doubled marker escapes to a literal.
    /// Arrays and objects are resolved element-wise. A reference to a missing
    /// key is a `MISSING_DEPENDENCY` error.
    pub fn resolve_value(&self, value: &Value, marker: &str) -> Result<Value, ExecutionError> {
        match value {
            Value::String(s) if !marker.is_empty() => {
                let Some(path) = s.strip_prefix(marker) else {
                    return Ok(value.clone());
                };
                if path.starts_with(marker) {
                    return Ok(Value::String(path.to_string()));
                }
                self.get(path).cloned().ok_or_else(|| {
                    ExecutionError::new(
                        ErrorKind::MissingDependency,
                        format!("reference '{s}' not found in shared memory"),
                    )
                    .with_context("reference", path)
                })
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, marker))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v, marker)?)))
                .collect::<Result<Map<_, _>, ExecutionError>>()
                .map(Value::Object),
            _ => Ok(value.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Fill `{{ name }}` placeholders from `scope`, which must be an object.
///
/// Names may be dot paths. Unknown placeholders are left as-is.
pub fn render_template(template: &str, scope: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + len;
        let name = rest[start + 2..end].trim();

        out.push_str(&rest[..start]);
        let resolved = scope.get(name).or_else(|| lookup_path(scope, name));
        match resolved {
            Some(value) => out.push_str(&value_to_string(value)),
            None => out.push_str(&rest[start..end + 2]),
        }
        rest = &rest[end + 2..];
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lookup_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

/// Display form of a value inside rendered text.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
