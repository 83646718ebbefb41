//! Fault classification.
//!
//! `ErrorClassifier` turns any fault raised by a collaborator into an
//! [`ExecutionError`]. Typed faults found in the cause chain are mapped
//! first; message heuristics are the fallback. Classification is total:
//! anything unrecognized becomes `EXECUTION_FAILED` / `unknown`.

use std::backtrace::BacktraceStatus;

use stepwise_types::execution::{ErrorKind, ExecutionError};
use stepwise_types::llm::LlmError;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Fault
// ---------------------------------------------------------------------------

/// Typed faults collaborator code may raise to get an exact classification.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing key '{0}'")]
    MissingKey(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// ErrorClassifier
// ---------------------------------------------------------------------------

/// Stateless fault classifier.
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a fault. Never fails.
    pub fn classify(fault: &anyhow::Error) -> ExecutionError {
        let text = format!("{fault:#}");

        let mut error = Self::classify_typed(fault).unwrap_or_else(|| {
            let kind = Self::kind_from_message(&text);
            ExecutionError::new(kind, fault.to_string())
        });

        if error.cause.is_none() {
            error.cause = Some(text);
        }
        if error.backtrace.is_none() {
            let backtrace = fault.backtrace();
            if backtrace.status() == BacktraceStatus::Captured {
                error.backtrace = Some(backtrace.to_string());
            }
        }
        error
    }

    /// Map the first recognized typed fault in the cause chain.
    fn classify_typed(fault: &anyhow::Error) -> Option<ExecutionError> {
        for cause in fault.chain() {
            if let Some(err) = cause.downcast_ref::<ExecutionError>() {
                return Some(err.clone());
            }
            if let Some(f) = cause.downcast_ref::<Fault>() {
                return Some(Self::from_fault(f));
            }
            if let Some(e) = cause.downcast_ref::<LlmError>() {
                return Some(Self::from_llm_error(e));
            }
            if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
                return Some(ExecutionError::new(ErrorKind::Timeout, cause.to_string()));
            }
            if let Some(e) = cause.downcast_ref::<std::io::Error>() {
                if let Some(kind) = Self::kind_from_io(e.kind()) {
                    return Some(ExecutionError::new(kind, e.to_string()));
                }
            }
            if let Some(e) = cause.downcast_ref::<serde_json::Error>() {
                return Some(ExecutionError::new(
                    ErrorKind::InputValidationError,
                    e.to_string(),
                ));
            }
        }
        None
    }

    fn from_fault(fault: &Fault) -> ExecutionError {
        let message = fault.to_string();
        match fault {
            Fault::Timeout(_) => ExecutionError::new(ErrorKind::Timeout, message),
            Fault::InvalidInput(_) => ExecutionError::new(ErrorKind::InputValidationError, message),
            Fault::MissingKey(key) => ExecutionError::new(ErrorKind::MissingDependency, message)
                .with_context("key", key.as_str()),
            Fault::ResourceExhausted(_) => ExecutionError::new(ErrorKind::OutOfMemory, message),
            Fault::PermissionDenied(_) => ExecutionError::new(ErrorKind::SecurityError, message),
            Fault::Other(_) => ExecutionError::new(ErrorKind::ExecutionFailed, message),
        }
    }

    fn from_llm_error(err: &LlmError) -> ExecutionError {
        let message = err.to_string();
        match err {
            LlmError::RateLimited { retry_after_ms } => {
                let error = ExecutionError::new(ErrorKind::RateLimited, message);
                match retry_after_ms {
                    Some(ms) => error.with_context("retry_after_ms", *ms),
                    None => error,
                }
            }
            LlmError::Overloaded(_) | LlmError::Stream(_) => {
                ExecutionError::new(ErrorKind::RateLimited, message)
            }
            LlmError::ContextLengthExceeded { max, requested } => {
                ExecutionError::new(ErrorKind::OutOfMemory, message)
                    .with_context("max_tokens", *max)
                    .with_context("requested_tokens", *requested)
            }
            LlmError::AuthenticationFailed => ExecutionError::new(ErrorKind::SecurityError, message),
            LlmError::InvalidRequest(_) | LlmError::Deserialization(_) => {
                ExecutionError::new(ErrorKind::InputValidationError, message)
            }
            LlmError::Provider { .. } => ExecutionError::new(ErrorKind::ExecutionFailed, message),
        }
    }

    fn kind_from_io(kind: std::io::ErrorKind) -> Option<ErrorKind> {
        use std::io::ErrorKind as Io;
        match kind {
            Io::TimedOut => Some(ErrorKind::Timeout),
            Io::InvalidInput | Io::InvalidData => Some(ErrorKind::InputValidationError),
            Io::NotFound => Some(ErrorKind::MissingDependency),
            Io::OutOfMemory | Io::StorageFull => Some(ErrorKind::OutOfMemory),
            Io::PermissionDenied => Some(ErrorKind::SecurityError),
            _ => None,
        }
    }

    /// Heuristic mapping over the fault text; first match wins.
    fn kind_from_message(text: &str) -> ErrorKind {
        let lower = text.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["timeout", "timed out", "deadline has elapsed"]) {
            ErrorKind::Timeout
        } else if has(&["rate limit", "too many requests"]) {
            ErrorKind::RateLimited
        } else if has(&["invalid", "malformed", "parse error"]) {
            ErrorKind::InputValidationError
        } else if has(&["not found", "missing", "no such", "unknown key"]) {
            ErrorKind::MissingDependency
        } else if has(&["out of memory", "resource exhausted", "capacity", "memory limit"]) {
            ErrorKind::OutOfMemory
        } else if has(&["permission", "forbidden", "unauthorized", "security"]) {
            ErrorKind::SecurityError
        } else {
            ErrorKind::ExecutionFailed
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
