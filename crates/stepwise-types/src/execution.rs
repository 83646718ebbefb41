//! Classified execution errors.
//!
//! Every fault raised while a step runs is converted into an
//! [`ExecutionError`] before the executor sees it. The error's
//! [`ErrorCategory`] alone decides whether the executor retries the step or
//! ends the run.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad failure class that drives retry-vs-terminate behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient failure; the step may be re-attempted.
    Retriable,
    /// Configuration, security, or structural failure; ends the run.
    Fatal,
    /// Bad input or schema; never retried.
    Validation,
    /// A required input, tool, or function is missing.
    Dependency,
    /// Needs external intervention (approval rejected, guardrail block).
    User,
    /// Memory or capacity exhaustion.
    Resource,
    /// Unrecognized fault. Treated as non-retriable.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Retriable => write!(f, "retriable"),
            ErrorCategory::Fatal => write!(f, "fatal"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Dependency => write!(f, "dependency"),
            ErrorCategory::User => write!(f, "user"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Enumerated error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    RateLimited,
    ToolError,
    InputValidationError,
    MissingDependency,
    OutOfMemory,
    SecurityError,
    ExecutionFailed,
    NodeNotFound,
    NoExecutableSteps,
    InvalidConfiguration,
    MaxStepsExceeded,
    SubWorkflowDepthExceeded,
    Cancelled,
    DeadlineExceeded,
    GuardrailBlocked,
    ApprovalRejected,
}

impl ErrorKind {
    /// The category an error of this kind gets unless explicitly overridden.
    pub fn default_category(self) -> ErrorCategory {
        match self {
            ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::ToolError => {
                ErrorCategory::Retriable
            }
            ErrorKind::InputValidationError => ErrorCategory::Validation,
            ErrorKind::MissingDependency => ErrorCategory::Dependency,
            ErrorKind::OutOfMemory => ErrorCategory::Resource,
            ErrorKind::GuardrailBlocked | ErrorKind::ApprovalRejected => ErrorCategory::User,
            ErrorKind::ExecutionFailed => ErrorCategory::Unknown,
            ErrorKind::SecurityError
            | ErrorKind::NodeNotFound
            | ErrorKind::NoExecutableSteps
            | ErrorKind::InvalidConfiguration
            | ErrorKind::MaxStepsExceeded
            | ErrorKind::SubWorkflowDepthExceeded
            | ErrorKind::Cancelled
            | ErrorKind::DeadlineExceeded => ErrorCategory::Fatal,
        }
    }

    /// Stable code string (e.g. `"MISSING_DEPENDENCY"`).
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ToolError => "TOOL_ERROR",
            ErrorKind::InputValidationError => "INPUT_VALIDATION_ERROR",
            ErrorKind::MissingDependency => "MISSING_DEPENDENCY",
            ErrorKind::OutOfMemory => "OUT_OF_MEMORY",
            ErrorKind::SecurityError => "SECURITY_ERROR",
            ErrorKind::ExecutionFailed => "EXECUTION_FAILED",
            ErrorKind::NodeNotFound => "NODE_NOT_FOUND",
            ErrorKind::NoExecutableSteps => "NO_EXECUTABLE_STEPS",
            ErrorKind::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorKind::MaxStepsExceeded => "MAX_STEPS_EXCEEDED",
            ErrorKind::SubWorkflowDepthExceeded => "SUB_WORKFLOW_DEPTH_EXCEEDED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::GuardrailBlocked => "GUARDRAIL_BLOCKED",
            ErrorKind::ApprovalRejected => "APPROVAL_REJECTED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// A classified fault raised during step execution.
///
/// Retriability is never stored: [`ExecutionError::is_retriable`] reads it
/// off the category, so the two can not disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub message: String,
    /// Free-form diagnostic attributes (step id, tool name, flags).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Display text of the original fault, including its cause chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Captured backtrace, when one was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl ExecutionError {
    /// Create an error with the kind's default category.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            category: kind.default_category(),
            message: message.into(),
            context: BTreeMap::new(),
            cause: None,
            backtrace: None,
        }
    }

    /// Override the category.
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// Attach a context attribute.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach the original fault text.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Whether the executor may re-attempt the failed step.
    pub fn is_retriable(&self) -> bool {
        self.category == ErrorCategory::Retriable
    }

    /// Whether the error ends the run without a retry.
    pub fn is_terminal(&self) -> bool {
        !self.is_retriable()
    }

    /// Re-frame a retriable error whose retries are spent as fatal.
    ///
    /// The kind is kept so the original failure stays identifiable; the
    /// previous message moves into `cause`.
    pub fn promote_to_fatal(self, attempts: u32) -> Self {
        let cause = match &self.cause {
            Some(inner) => format!("{}: {} ({inner})", self.kind, self.message),
            None => format!("{}: {}", self.kind, self.message),
        };
        Self {
            kind: self.kind,
            category: ErrorCategory::Fatal,
            message: format!("retries exhausted after {attempts} attempts: {}", self.message),
            context: self.context,
            cause: Some(cause),
            backtrace: self.backtrace,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
