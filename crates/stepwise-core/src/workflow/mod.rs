//! Workflow engine core: definitions, step dispatch, and the run state machine.
//!
//! - `definition` -- YAML parsing and validation of graphs and plans
//! - `dag` -- petgraph structure checks and plan execution waves
//! - `memory` -- per-run shared memory with reference resolution
//! - `expression` -- JEXL evaluator for conditional edges
//! - `extract` -- structured data extraction from model replies
//! - `classify` -- fault to `ExecutionError` classification
//! - `worker` -- dispatch of one step to its executor kind
//! - `guardrail` -- pre/post decision policy checks
//! - `ledger` -- decision/outcome audit log for one run
//! - `checkpoint` -- snapshot store with save and retention policies
//! - `retry` -- retry-versus-terminate decisions
//! - `transition` -- next-step selection for graphs and plans
//! - `executor` -- graph and plan execution, resume, cancellation, fan-out
//! - `collaborators` -- sub-workflow, sandbox and approval traits

pub mod checkpoint;
pub mod classify;
pub mod collaborators;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod extract;
pub mod guardrail;
pub mod ledger;
pub mod memory;
pub mod retry;
pub mod transition;
pub mod worker;

pub use checkpoint::{CheckpointError, CheckpointState, CheckpointStore};
pub use classify::{ErrorClassifier, Fault};
pub use executor::{Executor, ExecutorError, GraphRequest, RunReport};
pub use guardrail::{GuardrailEngine, RunCounters};
pub use ledger::{OutcomeResult, RunLedger};
pub use memory::SharedMemory;
pub use worker::{StepContext, StepExecutionResult, Worker};
