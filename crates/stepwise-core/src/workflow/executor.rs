//! Run executor: the graph-mode and plan-mode state machines.
//!
//! One run advances one step at a time. For every dispatch the executor:
//!
//! 1. checks the run deadline and cancellation token,
//! 2. enforces the step visit and run dispatch limits,
//! 3. asks the approval gate (steps flagged `requires_approval`),
//! 4. asks the guardrail engine for permission,
//! 5. records a decision, dispatches to the worker, records the outcome,
//! 6. runs the post-decision guardrail checks,
//! 7. checkpoints if the save policy says so,
//! 8. retries, terminates, or moves on to the next step.
//!
//! Graph mode follows the first matching outgoing edge. Plan mode runs the
//! first step whose dependencies have all completed. A non-retriable error
//! ends the run immediately; the ledger receives a problem entry and the
//! run narrative names the error kind and the last checkpoint position.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Value, json};
use stepwise_types::checkpoint::Checkpoint;
use stepwise_types::config::EngineConfig;
use stepwise_types::event::RunEvent;
use stepwise_types::execution::{ErrorCategory, ErrorKind, ExecutionError};
use stepwise_types::guardrail::{GuardrailAction, GuardrailResult};
use stepwise_types::run::{DecisionOption, Run, RunStatus, Severity};
use stepwise_types::workflow::{Edge, EdgeCondition, Plan, Step, WorkflowGraph};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::RunStorage;

use super::checkpoint::{CheckpointError, CheckpointState, CheckpointStore};
use super::classify::ErrorClassifier;
use super::collaborators::ApprovalGate;
use super::definition::{DefinitionError, validate_graph, validate_plan};
use super::expression::ExpressionEvaluator;
use super::guardrail::{DecisionOutcome, DecisionPlan, GuardrailEngine, RunCounters};
use super::ledger::{OutcomeResult, RunLedger};
use super::memory::SharedMemory;
use super::retry::{RetryDecision, RetryHandler};
use super::transition::{LastResult, Transition, next_edge, ready_steps};
use super::worker::{StepContext, StepExecutionResult, Worker};

// ---------------------------------------------------------------------------
// Reports and requests
// ---------------------------------------------------------------------------

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The closed run record, with decisions, problems and metrics.
    pub run: Run,
    pub status: RunStatus,
    pub memory: SharedMemory,
    pub execution_path: Vec<String>,
    /// The run-ending error, if the run failed.
    pub error: Option<ExecutionError>,
    /// The last checkpoint written by this run.
    pub last_checkpoint: Option<Uuid>,
}

impl RunReport {
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// One independent graph run for [`Executor::execute_many`].
#[derive(Debug, Clone)]
pub struct GraphRequest {
    pub graph: Arc<WorkflowGraph>,
    pub input: Value,
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CheckpointMark {
    id: Uuid,
    node_id: String,
    step_counter: u64,
}

/// Everything one run owns. Created at run start, consumed by `finish`.
struct RunState<S: RunStorage> {
    run_id: Uuid,
    ledger: RunLedger<S>,
    memory: SharedMemory,
    counters: RunCounters,
    path: Vec<String>,
    step_counter: u64,
    completed: HashSet<String>,
    failed: HashSet<String>,
    visits: HashMap<String, u32>,
    total_tokens: u64,
    total_latency_ms: u64,
    last_checkpoint: Option<CheckpointMark>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started: Instant,
}

impl<S: RunStorage> RunState<S> {
    fn checkpoint_state(&self) -> CheckpointState {
        let mut completed: Vec<String> = self.completed.iter().cloned().collect();
        completed.sort();
        let mut failed: Vec<String> = self.failed.iter().cloned().collect();
        failed.sort();
        CheckpointState {
            execution_path: self.path.clone(),
            step_counter: self.step_counter,
            completed_steps: completed,
            failed_steps: failed,
            total_tokens: self.total_tokens,
            total_latency_ms: self.total_latency_ms,
        }
    }

    /// Continue from a checkpoint written by an earlier run.
    fn adopt(&mut self, checkpoint: &Checkpoint) {
        self.path = checkpoint.execution_path.clone();
        self.step_counter = checkpoint.step_counter;
        self.completed = checkpoint.completed_steps.iter().cloned().collect();
        self.total_tokens = checkpoint.total_tokens;
        self.total_latency_ms = checkpoint.total_latency_ms;
        self.counters.total_tokens = checkpoint.total_tokens;
        self.visits.clear();
        for step_id in &self.path {
            *self.visits.entry(step_id.clone()).or_default() += 1;
        }
    }
}

/// A run-ending error and the decision it belongs to, if one was recorded.
#[derive(Debug)]
struct RunFailure {
    error: ExecutionError,
    decision_id: Option<String>,
}

impl From<ExecutionError> for RunFailure {
    fn from(error: ExecutionError) -> Self {
        Self {
            error,
            decision_id: None,
        }
    }
}

/// What a resume starts from.
struct Restored {
    input: Value,
    memory: SharedMemory,
    checkpoint: Option<Checkpoint>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Drives graph and plan runs.
///
/// Generic over `S: RunStorage` so the ledger and checkpoint store share one
/// storage backend. Guardrail counters and shared memory are created per run
/// and never shared between runs.
pub struct Executor<S: RunStorage> {
    storage: Arc<S>,
    worker: Arc<Worker>,
    guardrails: GuardrailEngine,
    checkpoints: Arc<CheckpointStore<S>>,
    config: EngineConfig,
    event_bus: EventBus,
    approval: Option<Arc<dyn ApprovalGate>>,
    /// Sub-workflow nesting depth of runs started here.
    depth: u32,
    /// Cancellation tokens of in-flight runs, keyed by run ID.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: RunStorage + 'static> Executor<S> {
    /// Create an executor. Per-step limits come from the worker's own
    /// `ExecutorConfig`; run limits come from `config.executor`.
    pub fn new(storage: Arc<S>, worker: Worker, config: EngineConfig) -> Self {
        Self {
            checkpoints: Arc::new(CheckpointStore::new(Arc::clone(&storage), config.checkpoint.clone())),
            guardrails: GuardrailEngine::new(config.guardrails.clone()),
            storage,
            worker: Arc::new(worker),
            config,
            event_bus: EventBus::default(),
            approval: None,
            depth: 0,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    /// Run nested under a parent workflow at `depth`.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn checkpoints(&self) -> &CheckpointStore<S> {
        &self.checkpoints
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Execute a workflow graph from its entry step.
    pub async fn execute_graph(&self, graph: &WorkflowGraph, input: Value) -> Result<RunReport, ExecutorError> {
        validate_graph(graph)?;
        let memory = SharedMemory::from_input(&input);
        let mut run = self.begin(&graph.id, &graph.description, input, memory).await;
        let result = self.drive_graph(graph, &mut run, Some(graph.entry.clone()), "entry step").await;
        self.finish(run, result).await
    }

    /// Execute a plan in dependency order.
    pub async fn execute_plan(&self, plan: &Plan, input: Value) -> Result<RunReport, ExecutorError> {
        validate_plan(plan)?;
        let memory = SharedMemory::from_input(&input);
        let mut run = self.begin(&plan.id, &plan.goal, input, memory).await;
        let result = self.drive_plan(plan, &mut run).await;
        self.finish(run, result).await
    }

    /// Continue a graph run from its latest checkpoint.
    ///
    /// The continuation is recorded as a new run whose input names the
    /// earlier one. With no checkpoint the graph starts over from its entry
    /// step with the earlier run's input.
    pub async fn resume_graph(&self, graph: &WorkflowGraph, run_id: Uuid) -> Result<RunReport, ExecutorError> {
        validate_graph(graph)?;
        let restored = self.restore(run_id).await?;
        let mut run = self
            .begin(&graph.id, &graph.description, restored.input, restored.memory)
            .await;

        let current = match &restored.checkpoint {
            Some(checkpoint) => {
                run.adopt(checkpoint);
                (!checkpoint.node_id.is_empty()).then(|| checkpoint.node_id.clone())
            }
            None => Some(graph.entry.clone()),
        };
        tracing::info!(
            run_id = %run.run_id,
            resumed_from = %run_id,
            resume_at = current.as_deref().unwrap_or("<finished>"),
            "resuming graph run"
        );

        let result = self.drive_graph(graph, &mut run, current, "resumed from checkpoint").await;
        self.finish(run, result).await
    }

    /// Continue a plan run from its latest checkpoint.
    ///
    /// Completed steps are skipped; steps that had failed are attempted again.
    pub async fn resume_plan(&self, plan: &Plan, run_id: Uuid) -> Result<RunReport, ExecutorError> {
        validate_plan(plan)?;
        let restored = self.restore(run_id).await?;
        let mut run = self.begin(&plan.id, &plan.goal, restored.input, restored.memory).await;
        if let Some(checkpoint) = &restored.checkpoint {
            run.adopt(checkpoint);
        }
        tracing::info!(
            run_id = %run.run_id,
            resumed_from = %run_id,
            skipping = run.completed.len(),
            "resuming plan run"
        );

        let result = self.drive_plan(plan, &mut run).await;
        self.finish(run, result).await
    }

    /// Cancel an in-flight run. It stops at the top of its next step.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let Some((_, token)) = self.cancellation_tokens.remove(&run_id) else {
            return Err(ExecutorError::RunNotFound(run_id));
        };
        token.cancel();
        tracing::info!(run_id = %run_id, "run cancellation requested");
        Ok(())
    }

    /// Run independent graphs concurrently, each with its own memory and
    /// guardrail counters. Results are returned in request order.
    pub async fn execute_many(self: &Arc<Self>, requests: Vec<GraphRequest>) -> Vec<Result<RunReport, ExecutorError>> {
        let mut slots: Vec<Option<Result<RunReport, ExecutorError>>> =
            (0..requests.len()).map(|_| None).collect();
        let mut join_set = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let executor = Arc::clone(self);
            join_set.spawn(async move {
                let result = executor.execute_graph(&request.graph, request.input).await;
                (index, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "fan-out run task failed"),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(ExecutorError::Join("run task did not complete".to_string()))))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    async fn begin(&self, goal_id: &str, description: &str, input: Value, memory: SharedMemory) -> RunState<S> {
        let mut ledger = RunLedger::new(Arc::clone(&self.storage));
        let run_id = ledger.start_run(goal_id, description, input).await;

        let cancel = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, cancel.clone());

        self.event_bus.publish(RunEvent::RunStarted {
            run_id,
            goal_id: goal_id.to_string(),
        });

        let started = Instant::now();
        RunState {
            run_id,
            ledger,
            memory,
            counters: RunCounters::default(),
            path: Vec::new(),
            step_counter: 0,
            completed: HashSet::new(),
            failed: HashSet::new(),
            visits: HashMap::new(),
            total_tokens: 0,
            total_latency_ms: 0,
            last_checkpoint: None,
            cancel,
            deadline: self
                .config
                .executor
                .run_timeout_secs
                .map(|secs| started + Duration::from_secs(secs)),
            started,
        }
    }

    async fn finish(&self, mut run: RunState<S>, result: Result<(), RunFailure>) -> Result<RunReport, ExecutorError> {
        self.cancellation_tokens.remove(&run.run_id);
        let duration_ms = run.started.elapsed().as_millis() as u64;

        let (status, error) = match result {
            Ok(()) => {
                let narrative = format!(
                    "completed {} step(s) in {duration_ms}ms: {}",
                    run.completed.len(),
                    run.path.join(" -> ")
                );
                run.ledger.end_run(true, &narrative, Some(run.memory.to_json())).await;
                tracing::info!(run_id = %run.run_id, duration_ms, steps = run.path.len(), "run completed");
                self.event_bus.publish(RunEvent::RunCompleted {
                    run_id: run.run_id,
                    duration_ms,
                    steps_completed: run.completed.len() as u64,
                });
                (RunStatus::Completed, None)
            }
            Err(failure) => {
                let error = failure.error;
                tracing::error!(
                    run_id = %run.run_id,
                    kind = %error.kind,
                    category = %error.category,
                    error = %error,
                    "run failed"
                );
                run.ledger.report_problem(
                    Severity::Critical,
                    &error.to_string(),
                    failure.decision_id.as_deref(),
                    Some(root_cause(&error)),
                    Some(suggested_fix(&error).to_string()),
                );
                let narrative = failure_narrative(&error, run.last_checkpoint.as_ref());
                run.ledger.end_run(false, &narrative, None).await;
                self.event_bus.publish(RunEvent::RunFailed {
                    run_id: run.run_id,
                    error_kind: error.kind.to_string(),
                    error: error.to_string(),
                });
                (RunStatus::Failed, Some(error))
            }
        };

        let run_id = run.run_id;
        let record = run.ledger.into_run().ok_or(ExecutorError::RunRecordMissing(run_id))?;
        Ok(RunReport {
            run: record,
            status,
            memory: run.memory,
            execution_path: run.path,
            error,
            last_checkpoint: run.last_checkpoint.map(|mark| mark.id),
        })
    }

    async fn restore(&self, run_id: Uuid) -> Result<Restored, ExecutorError> {
        let checkpoint = self.checkpoints.restore_checkpoint(run_id).await?;
        let previous = self
            .storage
            .load_run(&run_id)
            .await
            .map_err(|e| ExecutorError::Storage(e.to_string()))?;
        if checkpoint.is_none() && previous.is_none() {
            return Err(ExecutorError::RunNotFound(run_id));
        }

        let original_input = match previous.map(|run| run.input) {
            Some(Value::Object(mut fields)) if fields.contains_key("resumed_from") => {
                fields.remove("input").unwrap_or(Value::Null)
            }
            Some(input) => input,
            None => Value::Null,
        };
        let memory = match &checkpoint {
            Some(cp) => SharedMemory::from_json(cp.memory.clone()).map_err(|e| ExecutorError::InvalidCheckpoint {
                run_id,
                reason: e.to_string(),
            })?,
            None => SharedMemory::from_input(&original_input),
        };

        Ok(Restored {
            input: json!({ "resumed_from": run_id.to_string(), "input": original_input }),
            memory,
            checkpoint,
        })
    }

    // -----------------------------------------------------------------------
    // Mode loops
    // -----------------------------------------------------------------------

    async fn drive_graph(
        &self,
        graph: &WorkflowGraph,
        run: &mut RunState<S>,
        mut current: Option<String>,
        first_reason: &str,
    ) -> Result<(), RunFailure> {
        let mut reasoning = first_reason.to_string();

        while let Some(step_id) = current.take() {
            self.check_interrupt(run, &step_id).await?;
            let step = graph.step(&step_id).ok_or_else(|| {
                ExecutionError::new(ErrorKind::NodeNotFound, format!("step '{step_id}' is not declared"))
                    .with_context("step_id", step_id.clone())
            })?;
            self.enter_step(run, step)?;

            let result = self.run_step(run, step, &reasoning).await?;
            if result.success {
                run.completed.insert(step.id.clone());
            } else {
                run.failed.insert(step.id.clone());
            }

            let transition = select_edge(graph, &step.id, &result, &run.memory)?;
            let next = match transition {
                Transition::Next(edge) => {
                    apply_input_mapping(&mut run.memory, edge)?;
                    reasoning = format!("edge {} -> {} ({})", edge.source, edge.target, describe_condition(edge));
                    Some(edge.target.clone())
                }
                Transition::Finished if !result.success => {
                    return Err(soft_failure_error(step, &result).into());
                }
                Transition::Finished => None,
            };

            self.save_checkpoint(run, next.as_deref().unwrap_or_default()).await;
            current = next;
        }
        Ok(())
    }

    async fn drive_plan(&self, plan: &Plan, run: &mut RunState<S>) -> Result<(), RunFailure> {
        loop {
            let Some(step) = ready_steps(plan, &run.completed, &run.failed).first().copied() else {
                break;
            };
            self.check_interrupt(run, &step.id).await?;
            self.enter_step(run, step)?;

            let result = self.run_step(run, step, "dependencies satisfied").await?;
            if result.success {
                run.completed.insert(step.id.clone());
            } else {
                tracing::warn!(
                    run_id = %run.run_id,
                    step_id = %step.id,
                    error = result.error.as_deref().unwrap_or_default(),
                    "plan step failed; its dependents will not run"
                );
                run.failed.insert(step.id.clone());
            }

            let next = ready_steps(plan, &run.completed, &run.failed)
                .first()
                .map(|s| s.id.clone())
                .unwrap_or_default();
            self.save_checkpoint(run, &next).await;
        }

        let pending: Vec<&str> = plan
            .steps
            .iter()
            .filter(|s| !run.completed.contains(&s.id) && !run.failed.contains(&s.id))
            .map(|s| s.id.as_str())
            .collect();
        let mut failed: Vec<&str> = run.failed.iter().map(String::as_str).collect();
        failed.sort_unstable();

        if !pending.is_empty() {
            return Err(ExecutionError::new(
                ErrorKind::NoExecutableSteps,
                format!("no executable steps; pending: {}", pending.join(", ")),
            )
            .with_context("pending_steps", json!(pending))
            .with_context("failed_steps", json!(failed))
            .into());
        }
        if !failed.is_empty() {
            return Err(ExecutionError::new(
                ErrorKind::ExecutionFailed,
                format!("plan finished with failed steps: {}", failed.join(", ")),
            )
            .with_context("failed_steps", json!(failed))
            .into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Per-step pipeline
    // -----------------------------------------------------------------------

    /// Stop if the run was cancelled or its deadline passed.
    async fn check_interrupt(&self, run: &mut RunState<S>, pending_step: &str) -> Result<(), RunFailure> {
        let error = if run.cancel.is_cancelled() {
            ExecutionError::new(ErrorKind::Cancelled, "run cancelled")
        } else if run.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            ExecutionError::new(ErrorKind::DeadlineExceeded, "run deadline exceeded")
                .with_context("run_timeout_secs", json!(self.config.executor.run_timeout_secs))
        } else {
            return Ok(());
        };

        tracing::info!(run_id = %run.run_id, step_id = pending_step, kind = %error.kind, "run interrupted");
        self.save_checkpoint(run, pending_step).await;
        Err(error.with_context("step_id", pending_step).into())
    }

    /// Count a visit and append the step to the execution path.
    fn enter_step(&self, run: &mut RunState<S>, step: &Step) -> Result<(), ExecutionError> {
        let visits = run.visits.entry(step.id.clone()).or_default();
        *visits += 1;
        if let Some(max) = step.max_visits {
            if *visits > max {
                return Err(ExecutionError::new(
                    ErrorKind::MaxStepsExceeded,
                    format!("step '{}' visited more than {max} times", step.id),
                )
                .with_context("step_id", step.id.clone())
                .with_context("max_visits", max));
            }
        }
        run.path.push(step.id.clone());
        Ok(())
    }

    /// Approve, then dispatch with retries until success, soft failure, or a
    /// run-ending error.
    async fn run_step(&self, run: &mut RunState<S>, step: &Step, reasoning: &str) -> Result<StepExecutionResult, RunFailure> {
        self.approve(run, step).await?;

        let max_retries = RetryHandler::max_retries(step, self.guardrails.config());
        let mut retries_used = 0;
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                self.check_interrupt(run, &step.id).await?;
            }

            let failure = match self.attempt(run, step, attempt, reasoning).await {
                Ok(result) => return Ok(result),
                Err(failure) => failure,
            };
            let message = failure.error.to_string();

            match RetryHandler::decide(failure.error, retries_used, max_retries) {
                RetryDecision::Retry { next_attempt } => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        step_id = %step.id,
                        attempt,
                        error = %message,
                        "step failed, retrying"
                    );
                    self.event_bus.publish(RunEvent::StepFailed {
                        run_id: run.run_id,
                        step_id: step.id.clone(),
                        error: message,
                        will_retry: true,
                    });
                    self.save_checkpoint(run, &step.id).await;
                    retries_used += 1;
                    attempt = next_attempt;
                }
                RetryDecision::Terminate(error) => {
                    self.event_bus.publish(RunEvent::StepFailed {
                        run_id: run.run_id,
                        step_id: step.id.clone(),
                        error: error.to_string(),
                        will_retry: false,
                    });
                    self.save_checkpoint(run, &step.id).await;
                    return Err(RunFailure {
                        error,
                        decision_id: failure.decision_id,
                    });
                }
            }
        }
    }

    async fn approve(&self, run: &RunState<S>, step: &Step) -> Result<(), RunFailure> {
        if !step.requires_approval {
            return Ok(());
        }
        let Some(gate) = &self.approval else {
            return Err(ExecutionError::new(
                ErrorKind::InvalidConfiguration,
                format!("step '{}' requires approval but no approval gate is configured", step.id),
            )
            .with_context("step_id", step.id.clone())
            .into());
        };

        tracing::debug!(run_id = %run.run_id, step_id = %step.id, "awaiting approval");
        let reviewed = tokio::select! {
            reviewed = gate.review(run.run_id, step) => reviewed,
            _ = run.cancel.cancelled() => {
                return Err(ExecutionError::new(ErrorKind::Cancelled, "run cancelled while awaiting approval")
                    .with_context("step_id", step.id.clone())
                    .into());
            }
        };
        let decision = reviewed.map_err(|fault| ErrorClassifier::classify(&fault).with_context("step_id", step.id.clone()))?;

        if decision.is_approved() {
            tracing::debug!(run_id = %run.run_id, step_id = %step.id, "step approved");
            return Ok(());
        }
        let reason = decision.reason.unwrap_or_else(|| "no reason given".to_string());
        Err(ExecutionError::new(
            ErrorKind::ApprovalRejected,
            format!("step '{}' was rejected: {reason}", step.id),
        )
        .with_context("step_id", step.id.clone())
        .into())
    }

    /// One guarded, recorded dispatch.
    async fn attempt(
        &self,
        run: &mut RunState<S>,
        step: &Step,
        attempt: u32,
        reasoning: &str,
    ) -> Result<StepExecutionResult, RunFailure> {
        let max_steps = self.config.executor.max_steps;
        if run.step_counter >= max_steps {
            return Err(ExecutionError::new(
                ErrorKind::MaxStepsExceeded,
                format!("run reached its limit of {max_steps} dispatches"),
            )
            .with_context("step_id", step.id.clone())
            .with_context("max_steps", max_steps)
            .into());
        }

        let tool_name = step.tool_name().map(str::to_string);
        let plan = DecisionPlan {
            node_id: step.id.clone(),
            tool_name: tool_name.clone(),
            estimated_tokens: step.token_estimate(),
            is_retry: attempt > 1,
        };
        let verdict = self.guardrails.check_before(&plan, &run.counters);
        self.publish_guardrail(run.run_id, &step.id, &verdict);
        if let Some(violation) = verdict.blocking_violation() {
            return Err(ExecutionError::new(ErrorKind::GuardrailBlocked, violation.description.clone())
                .with_context("step_id", step.id.clone())
                .with_context("policy_id", violation.policy_id.clone())
                .with_context("remediation", violation.remediation.clone())
                .into());
        }
        if plan.is_retry {
            run.counters.record_retry(&step.id);
            run.ledger.note_retry();
        }

        let executor_type = step.action.executor_type();
        let option_description = if step.description.is_empty() {
            format!("run {executor_type} step '{}'", step.id)
        } else {
            step.description.clone()
        };
        let decision_id = run.ledger.decide(
            &format!("execute step '{}'", step.id),
            vec![DecisionOption::new(step.id.clone(), option_description, 1.0)],
            &step.id,
            reasoning,
            Some(&step.id),
            json!({
                "attempt": attempt,
                "executor_type": executor_type.to_string(),
                "memory_keys": run.memory.as_map().keys().collect::<Vec<_>>(),
            }),
        );

        self.event_bus.publish(RunEvent::StepStarted {
            run_id: run.run_id,
            step_id: step.id.clone(),
            executor_type: executor_type.to_string(),
            attempt,
        });
        run.step_counter += 1;

        let started = Instant::now();
        let mut ctx = StepContext {
            run_id: run.run_id,
            memory: &mut run.memory,
            depth: self.depth,
            attempt,
        };
        let result = self.worker.execute(step, &mut ctx).await;

        let (success, tokens_used, latency_ms) = match &result {
            Ok(r) => (r.success, r.tokens_used, r.latency_ms),
            Err(_) => (false, 0, started.elapsed().as_millis() as u64),
        };
        if let Some(tool) = &tool_name {
            run.counters.record_tool_call(tool);
        }
        run.counters.add_tokens(tokens_used);
        run.total_tokens += tokens_used;
        run.total_latency_ms += latency_ms;

        let after = self.guardrails.check_after(
            &DecisionOutcome {
                node_id: step.id.clone(),
                tool_name,
                success,
                latency_ms,
            },
            &mut run.counters,
        );
        self.publish_guardrail(run.run_id, &step.id, &after);

        match result {
            Ok(result) if result.success => {
                let changes = written_keys(step, &result);
                run.ledger.record_outcome(
                    &decision_id,
                    OutcomeResult::Success(Value::Object(result.outputs.clone())),
                    tokens_used,
                    latency_ms,
                    changes,
                );
                self.event_bus.publish(RunEvent::StepCompleted {
                    run_id: run.run_id,
                    step_id: step.id.clone(),
                    duration_ms: latency_ms,
                    tokens_used,
                });
                Ok(result)
            }
            Ok(result) => {
                let error = result.error.clone().unwrap_or_else(|| "step reported failure".to_string());
                run.ledger.record_outcome(
                    &decision_id,
                    OutcomeResult::Failure(error.clone()),
                    tokens_used,
                    latency_ms,
                    Vec::new(),
                );
                self.event_bus.publish(RunEvent::StepFailed {
                    run_id: run.run_id,
                    step_id: step.id.clone(),
                    error,
                    will_retry: false,
                });
                Ok(result)
            }
            Err(error) => {
                run.ledger.record_outcome(
                    &decision_id,
                    OutcomeResult::Failure(error.to_string()),
                    tokens_used,
                    latency_ms,
                    Vec::new(),
                );
                Err(RunFailure {
                    error,
                    decision_id: Some(decision_id),
                })
            }
        }
    }

    /// Write a checkpoint if one is due. Failures are logged, never fatal.
    ///
    /// At most one checkpoint is written per step counter value, so a run's
    /// checkpoints stay totally ordered by counter.
    async fn save_checkpoint(&self, run: &mut RunState<S>, node_id: &str) {
        if !self.checkpoints.is_due(run.step_counter) {
            return;
        }
        if run
            .last_checkpoint
            .as_ref()
            .is_some_and(|mark| mark.step_counter == run.step_counter)
        {
            return;
        }
        let state = run.checkpoint_state();
        match self
            .checkpoints
            .save(run.run_id, node_id, &run.memory.to_json(), &state)
            .await
        {
            Ok(Some(checkpoint_id)) => {
                self.event_bus.publish(RunEvent::CheckpointSaved {
                    run_id: run.run_id,
                    checkpoint_id,
                    node_id: node_id.to_string(),
                    step_counter: run.step_counter,
                });
                run.last_checkpoint = Some(CheckpointMark {
                    id: checkpoint_id,
                    node_id: node_id.to_string(),
                    step_counter: run.step_counter,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(run_id = %run.run_id, node_id, error = %e, "checkpoint write failed"),
        }
    }

    fn publish_guardrail(&self, run_id: Uuid, step_id: &str, result: &GuardrailResult) {
        for violation in result.violations.iter().filter(|v| v.action != GuardrailAction::Allow) {
            self.event_bus.publish(RunEvent::GuardrailTriggered {
                run_id,
                step_id: step_id.to_string(),
                policy_id: violation.policy_id.clone(),
                action: violation.action,
            });
        }
    }
}

impl<S: RunStorage> std::fmt::Debug for Executor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("worker", &self.worker)
            .field("config", &self.config)
            .field("has_approval_gate", &self.approval.is_some())
            .field("depth", &self.depth)
            .field("in_flight", &self.cancellation_tokens.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pick the next edge. Kept synchronous so the evaluator never lives across
/// an await point.
fn select_edge<'g>(
    graph: &'g WorkflowGraph,
    step_id: &str,
    result: &StepExecutionResult,
    memory: &SharedMemory,
) -> Result<Transition<'g>, ExecutionError> {
    let evaluator = ExpressionEvaluator::new();
    let memory = memory.to_json();
    next_edge(
        graph,
        LastResult {
            step_id,
            success: result.success,
            outputs: &result.outputs,
            memory: &memory,
        },
        &evaluator,
    )
}

/// Copy `memory[source]` to `memory[target]` for each mapping entry.
fn apply_input_mapping(memory: &mut SharedMemory, edge: &Edge) -> Result<(), ExecutionError> {
    for (target, source) in &edge.input_mapping {
        if !memory.copy_key(source, target)? {
            tracing::debug!(from = %edge.source, to = %edge.target, source, "input mapping source missing");
        }
    }
    Ok(())
}

fn describe_condition(edge: &Edge) -> String {
    match &edge.condition {
        EdgeCondition::Always => "always".to_string(),
        EdgeCondition::OnSuccess => "on_success".to_string(),
        EdgeCondition::OnFailure => "on_failure".to_string(),
        EdgeCondition::Expression { expression } => format!("when {expression}"),
        EdgeCondition::Decided { label } => format!("decided '{label}'"),
    }
}

fn written_keys(step: &Step, result: &StepExecutionResult) -> Vec<String> {
    if step.output_keys.is_empty() {
        result.outputs.keys().cloned().collect()
    } else {
        step.output_keys.clone()
    }
}

/// The run-ending error for a soft failure with nowhere to go.
fn soft_failure_error(step: &Step, result: &StepExecutionResult) -> ExecutionError {
    let kind = result.error_kind.unwrap_or(ErrorKind::ExecutionFailed);
    ExecutionError::new(
        kind,
        result
            .error
            .clone()
            .unwrap_or_else(|| format!("step '{}' failed", step.id)),
    )
    .with_category(ErrorCategory::Fatal)
    .with_context("step_id", step.id.clone())
}

fn root_cause(error: &ExecutionError) -> String {
    let mut text = error.cause.clone().unwrap_or_else(|| error.message.clone());
    if !error.context.is_empty() {
        let context: Vec<String> = error.context.iter().map(|(k, v)| format!("{k}={v}")).collect();
        text.push_str(&format!(" [{}]", context.join(", ")));
    }
    text
}

fn suggested_fix(error: &ExecutionError) -> &'static str {
    match error.category {
        ErrorCategory::Retriable => "check the collaborator's availability and resume the run",
        ErrorCategory::Validation => "correct the step inputs or their schema",
        ErrorCategory::Dependency => "provide the missing input or register the missing tool",
        ErrorCategory::User => "review the guardrail policy or the approval decision",
        ErrorCategory::Resource => "reduce step output sizes or split the workflow",
        ErrorCategory::Fatal => match error.kind {
            ErrorKind::Cancelled | ErrorKind::DeadlineExceeded => "resume the run from its last checkpoint",
            _ if error.message.starts_with("retries exhausted") => {
                "check the collaborator's availability and resume the run"
            }
            _ => "fix the workflow definition or engine configuration",
        },
        ErrorCategory::Unknown => "inspect the recorded cause",
    }
}

fn failure_narrative(error: &ExecutionError, checkpoint: Option<&CheckpointMark>) -> String {
    let at = error
        .context
        .get("step_id")
        .and_then(Value::as_str)
        .map(|step| format!(" at step '{step}'"))
        .unwrap_or_default();
    let resume = match checkpoint {
        Some(mark) if mark.node_id.is_empty() => {
            format!("last checkpoint {} after the final step (step {})", mark.id, mark.step_counter)
        }
        Some(mark) => format!(
            "last checkpoint {} resumes at '{}' (step {})",
            mark.id, mark.node_id, mark.step_counter
        ),
        None => "no checkpoint was written".to_string(),
    };
    format!("run failed with {}{at}: {}; {resume}", error.kind, error.message)
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that prevent a run from starting or a report from being produced.
///
/// A run that starts and then fails is not an `ExecutorError`: it comes back
/// as a [`RunReport`] with status `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The graph or plan failed validation.
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// Checkpoint restoration failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("storage error: {0}")]
    Storage(String),

    /// The checkpoint's memory snapshot could not be restored.
    #[error("invalid checkpoint for run {run_id}: {reason}")]
    InvalidCheckpoint { run_id: Uuid, reason: String },

    /// No such run (for cancel/resume).
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run record missing for {0}")]
    RunRecordMissing(Uuid),

    /// A fan-out task did not complete.
    #[error("task join error: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use serde_json::Map;
    use stepwise_types::checkpoint::{RetentionPolicy, SaveFrequency};
    use stepwise_types::workflow::ActionSpec;

    use crate::storage::InMemoryRunStorage;
    use crate::tool::FunctionRegistry;
    use crate::workflow::classify::Fault;
    use crate::workflow::collaborators::ApprovalDecision;

    // -- Fixtures --

    fn function_step(id: &str, function: &str) -> Step {
        Step::new(
            id,
            ActionSpec::Function {
                name: function.into(),
                arguments: Map::new(),
            },
        )
    }

    fn graph(steps: Vec<Step>, edges: Vec<Edge>) -> WorkflowGraph {
        WorkflowGraph {
            id: "test-graph".into(),
            description: "test graph".into(),
            entry: steps[0].id.clone(),
            steps,
            edges,
        }
    }

    fn linear_plan(n: usize, function: &str) -> Plan {
        let steps = (1..=n)
            .map(|i| {
                let mut step = function_step(&format!("s{i}"), function);
                if i > 1 {
                    step.depends_on = vec![format!("s{}", i - 1)];
                }
                step
            })
            .collect();
        Plan {
            id: "test-plan".into(),
            goal: "run every step".into(),
            steps,
        }
    }

    fn executor(functions: FunctionRegistry, config: EngineConfig) -> (Arc<InMemoryRunStorage>, Executor<InMemoryRunStorage>) {
        let storage = Arc::new(InMemoryRunStorage::new());
        let worker = Worker::new(config.executor.clone()).with_functions(functions);
        (Arc::clone(&storage), Executor::new(storage, worker, config))
    }

    fn ok_functions() -> FunctionRegistry {
        let mut functions = FunctionRegistry::new();
        functions.register_sync("ok", |_| Ok(json!({ "value": 1 })));
        functions
    }

    fn counting(functions: &mut FunctionRegistry, name: &str, calls: &Arc<AtomicU32>) {
        let calls = Arc::clone(calls);
        functions.register_sync(name, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "done": true }))
        });
    }

    struct StaticGate(ApprovalDecision);

    impl ApprovalGate for StaticGate {
        fn review<'a>(&'a self, _run_id: Uuid, _step: &'a Step) -> BoxFuture<'a, anyhow::Result<ApprovalDecision>> {
            let decision = self.0.clone();
            async move { Ok(decision) }.boxed()
        }
    }

    // -- Graph mode --

    #[tokio::test]
    async fn two_step_graph_completes() {
        let (storage, executor) = executor(ok_functions(), EngineConfig::default());
        let mut events = executor.event_bus().subscribe();
        let g = graph(
            vec![function_step("a", "ok"), function_step("b", "ok")],
            vec![Edge::new("a", "b", EdgeCondition::OnSuccess)],
        );

        let report = executor.execute_graph(&g, json!({ "topic": "rust" })).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.execution_path, vec!["a", "b"]);
        assert_eq!(report.run.metrics.decision_count, 2);
        assert_eq!(report.run.metrics.success_rate(), 1.0);
        assert!(report.run.problems.is_empty());
        assert!(report.last_checkpoint.is_some());

        let stored = storage.load_run(&report.run_id()).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                RunEvent::RunStarted { .. } => "run_started",
                RunEvent::StepStarted { .. } => "step_started",
                RunEvent::StepCompleted { .. } => "step_completed",
                RunEvent::CheckpointSaved { .. } => "checkpoint",
                RunEvent::RunCompleted { .. } => "run_completed",
                _ => "other",
            });
        }
        assert_eq!(kinds.first(), Some(&"run_started"));
        assert_eq!(kinds.last(), Some(&"run_completed"));
        assert_eq!(kinds.iter().filter(|k| **k == "step_completed").count(), 2);
    }

    #[tokio::test]
    async fn dependency_error_fails_without_retry() {
        let (_, executor) = executor(ok_functions(), EngineConfig::default());
        let mut b = function_step("b", "ok");
        b.input_keys = vec!["never_written".into()];
        let g = graph(
            vec![function_step("a", "ok"), b],
            vec![Edge::new("a", "b", EdgeCondition::OnSuccess)],
        );

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::MissingDependency);
        assert_eq!(error.category, ErrorCategory::Dependency);
        assert_eq!(report.run.metrics.retries, 0);
        assert_eq!(report.run.problems.len(), 1);

        let b_decision = report
            .run
            .decisions
            .iter()
            .find(|d| d.node_id.as_deref() == Some("b"))
            .unwrap();
        assert_eq!(report.run.problems[0].decision_id.as_deref(), Some(b_decision.id.as_str()));
        assert!(report.run.narrative.unwrap().contains("MISSING_DEPENDENCY"));
    }

    #[tokio::test]
    async fn retriable_error_exhausts_retries_then_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut functions = FunctionRegistry::new();
        let counter = Arc::clone(&calls);
        functions.register_sync("flaky", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Fault::Timeout("upstream did not answer".into()).into())
        });
        let (_, executor) = executor(functions, EngineConfig::default());
        let g = graph(vec![function_step("a", "flaky")], vec![]);

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.run.metrics.retries, 3);
        assert_eq!(report.run.metrics.decision_count, 4);

        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.category, ErrorCategory::Fatal);
        assert!(error.message.starts_with("retries exhausted after 4 attempts"));
        assert_eq!(report.run.problems.len(), 1);
    }

    #[tokio::test]
    async fn tool_loop_blocks_repeated_failing_visits() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut functions = ok_functions();
        let counter = Arc::clone(&calls);
        functions.register_sync("check", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "success": false, "error": "still down" }))
        });
        let (_, executor) = executor(functions, EngineConfig::default());
        let g = graph(
            vec![function_step("poll", "check"), function_step("done", "ok")],
            vec![
                Edge::new("poll", "done", EdgeCondition::OnSuccess),
                Edge::new("poll", "poll", EdgeCondition::OnFailure),
            ],
        );

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::GuardrailBlocked);
        assert_eq!(error.category, ErrorCategory::User);
        assert_eq!(error.context["policy_id"], json!("tool_loop"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.run.metrics.decision_count, 3);
        assert_eq!(report.run.metrics.retries, 0);
    }

    #[tokio::test]
    async fn blocked_step_after_checkpoint_writes_no_duplicate() {
        let mut config = EngineConfig::default();
        config.guardrails.forbidden_tools = vec!["shell".into()];
        config.checkpoint.retention = RetentionPolicy::PruneOld { keep: 10 };
        let (_, executor) = executor(ok_functions(), config);
        let shell = Step::new(
            "b",
            ActionSpec::ToolUse {
                tool: "shell".into(),
                arguments: Map::new(),
            },
        );
        let g = graph(
            vec![function_step("a", "ok"), shell],
            vec![Edge::new("a", "b", EdgeCondition::OnSuccess)],
        );

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::GuardrailBlocked);
        let listed = executor.checkpoints().list(report.run_id()).await.unwrap();
        let marks: Vec<(u64, &str)> = listed.iter().map(|m| (m.step_counter, m.node_id.as_str())).collect();
        assert_eq!(marks, vec![(1, "b")]);
        assert_eq!(report.last_checkpoint, Some(listed[0].id));
    }

    #[tokio::test]
    async fn retries_write_one_checkpoint_per_attempt() {
        let mut functions = FunctionRegistry::new();
        functions.register_sync("flaky", |_| Err(Fault::Timeout("down".into()).into()));
        let mut config = EngineConfig::default();
        config.checkpoint.retention = RetentionPolicy::PruneOld { keep: 10 };
        let (_, executor) = executor(functions, config);
        let g = graph(vec![function_step("a", "flaky")], vec![]);

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let listed = executor.checkpoints().list(report.run_id()).await.unwrap();
        let counters: Vec<u64> = listed.iter().map(|m| m.step_counter).collect();
        assert_eq!(counters, vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn soft_failure_follows_failure_edge() {
        let mut functions = ok_functions();
        functions.register_sync("check", |_| {
            Ok(json!({ "success": false, "outputs": null, "error": "not ready" }))
        });
        let (_, executor) = executor(functions, EngineConfig::default());
        let g = graph(
            vec![
                function_step("a", "check"),
                function_step("publish", "ok"),
                function_step("fallback", "ok"),
            ],
            vec![
                Edge::new("a", "publish", EdgeCondition::OnSuccess),
                Edge::new("a", "fallback", EdgeCondition::OnFailure),
            ],
        );

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.execution_path, vec!["a", "fallback"]);
        assert_eq!(report.run.metrics.failure_count, 1);
        assert_eq!(report.run.metrics.success_count, 1);
    }

    #[tokio::test]
    async fn unmatched_failure_is_node_not_found() {
        let mut functions = ok_functions();
        functions.register_sync("check", |_| Ok(json!({ "success": false, "error": "nope" })));
        let (_, executor) = executor(functions, EngineConfig::default());
        let g = graph(
            vec![function_step("a", "check"), function_step("b", "ok")],
            vec![Edge::new("a", "b", EdgeCondition::OnSuccess)],
        );

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.error.unwrap().kind, ErrorKind::NodeNotFound);
        assert_eq!(report.execution_path, vec!["a"]);
    }

    #[tokio::test]
    async fn edge_mapping_and_expressions_route_data() {
        let mut functions = FunctionRegistry::new();
        functions.register_sync("score", |_| Ok(json!({ "score": 0.9 })));
        functions.register_sync("echo", |args| Ok(json!({ "seen": args.get("grade").cloned() })));
        let (_, executor) = executor(functions, EngineConfig::default());

        let mut high = Edge::new(
            "a",
            "high",
            EdgeCondition::Expression {
                expression: "outputs.score > 0.5".into(),
            },
        );
        high.input_mapping.insert("grade".into(), "score".into());
        let mut high_step = function_step("high", "echo");
        high_step.input_keys = vec!["grade".into()];

        let g = graph(
            vec![function_step("a", "score"), high_step, function_step("low", "echo")],
            vec![high, Edge::new("a", "low", EdgeCondition::Always).with_priority(10)],
        );

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.execution_path, vec!["a", "high"]);
        assert_eq!(report.memory.get("grade"), Some(&json!(0.9)));
        assert_eq!(report.memory.get("seen"), Some(&json!(0.9)));
    }

    #[tokio::test]
    async fn visit_limit_bounds_loops() {
        let (_, executor) = executor(ok_functions(), EngineConfig::default());
        let mut a = function_step("a", "ok");
        a.max_visits = Some(3);
        let mut g = graph(
            vec![a, function_step("done", "ok")],
            vec![Edge::new("a", "a", EdgeCondition::Always)],
        );
        // Terminal step keeps the graph valid; the loop never reaches it.
        g.edges.push(Edge::new("a", "done", EdgeCondition::OnFailure).with_priority(5));

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.error.unwrap().kind, ErrorKind::MaxStepsExceeded);
        assert_eq!(report.run.metrics.decision_count, 3);
    }

    #[tokio::test]
    async fn forbidden_tool_is_blocked_before_dispatch() {
        let mut config = EngineConfig::default();
        config.guardrails.forbidden_tools = vec!["shell".into()];
        let (_, executor) = executor(FunctionRegistry::new(), config);
        let mut events = executor.event_bus().subscribe();
        let step = Step::new(
            "run",
            ActionSpec::ToolUse {
                tool: "shell".into(),
                arguments: Map::new(),
            },
        );

        let report = executor.execute_graph(&graph(vec![step], vec![]), json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::GuardrailBlocked);
        assert_eq!(error.category, ErrorCategory::User);
        assert_eq!(error.context["policy_id"], json!("tool_forbidden"));
        assert_eq!(report.run.metrics.decision_count, 0);
        assert_eq!(report.run.problems.len(), 1);

        let mut blocked = false;
        while let Ok(event) = events.try_recv() {
            if let RunEvent::GuardrailTriggered { action, .. } = event {
                blocked |= action == GuardrailAction::Block;
            }
        }
        assert!(blocked);
    }

    #[tokio::test]
    async fn rejected_approval_fails_the_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut functions = FunctionRegistry::new();
        counting(&mut functions, "deploy", &calls);
        let (_, executor) = executor(functions, EngineConfig::default());
        let executor = executor.with_approval_gate(Arc::new(StaticGate(ApprovalDecision::reject("change freeze"))));
        let mut step = function_step("deploy", "deploy");
        step.requires_approval = true;

        let report = executor.execute_graph(&graph(vec![step], vec![]), json!({})).await.unwrap();

        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ApprovalRejected);
        assert_eq!(error.category, ErrorCategory::User);
        assert!(error.message.contains("change freeze"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn approved_step_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut functions = FunctionRegistry::new();
        counting(&mut functions, "deploy", &calls);
        let (_, executor) = executor(functions, EngineConfig::default());
        let executor = executor.with_approval_gate(Arc::new(StaticGate(ApprovalDecision::approve())));
        let mut step = function_step("deploy", "deploy");
        step.requires_approval = true;

        let report = executor.execute_graph(&graph(vec![step], vec![]), json!({})).await.unwrap();

        assert!(report.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn approval_without_gate_is_configuration_error() {
        let (_, executor) = executor(ok_functions(), EngineConfig::default());
        let mut step = function_step("deploy", "ok");
        step.requires_approval = true;

        let report = executor.execute_graph(&graph(vec![step], vec![]), json!({})).await.unwrap();

        assert_eq!(report.error.unwrap().kind, ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn cancellation_stops_at_next_step() {
        let mut functions = FunctionRegistry::new();
        functions.register("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!({ "done": true }))
        });
        let (_, executor) = executor(functions, EngineConfig::default());
        let executor = Arc::new(executor);
        let mut events = executor.event_bus().subscribe();
        let g = graph(
            vec![function_step("a", "slow"), function_step("b", "slow")],
            vec![Edge::new("a", "b", EdgeCondition::OnSuccess)],
        );

        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.execute_graph(&g, json!({})).await })
        };
        let run_id = loop {
            if let RunEvent::RunStarted { run_id, .. } = events.recv().await.unwrap() {
                break run_id;
            }
        };
        executor.cancel(run_id).unwrap();

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Cancelled);
        assert!(!error.is_retriable());
        assert_eq!(report.execution_path, vec!["a"]);

        let listed = executor.checkpoints().list(run_id).await.unwrap();
        let marks: Vec<(u64, &str)> = listed.iter().map(|m| (m.step_counter, m.node_id.as_str())).collect();
        assert_eq!(marks, vec![(1, "b")]);

        assert!(matches!(executor.cancel(run_id), Err(ExecutorError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn cancellation_checkpoints_only_when_due() {
        let mut functions = FunctionRegistry::new();
        functions.register("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!({ "done": true }))
        });
        let mut config = EngineConfig::default();
        config.checkpoint.frequency = SaveFrequency::EveryNNodes { n: 2 };
        let (_, executor) = executor(functions, config);
        let executor = Arc::new(executor);
        let mut events = executor.event_bus().subscribe();
        let g = graph(
            vec![function_step("a", "slow"), function_step("b", "slow")],
            vec![Edge::new("a", "b", EdgeCondition::OnSuccess)],
        );

        let running = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.execute_graph(&g, json!({})).await })
        };
        let run_id = loop {
            if let RunEvent::RunStarted { run_id, .. } = events.recv().await.unwrap() {
                break run_id;
            }
        };
        executor.cancel(run_id).unwrap();

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.error.unwrap().kind, ErrorKind::Cancelled);
        assert!(executor.checkpoints().list(run_id).await.unwrap().is_empty());
        assert!(report.last_checkpoint.is_none());
        assert!(report.run.narrative.unwrap().contains("no checkpoint was written"));
    }

    #[tokio::test]
    async fn run_deadline_is_enforced() {
        let mut functions = FunctionRegistry::new();
        functions.register("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            Ok(json!(null))
        });
        let mut config = EngineConfig::default();
        config.executor.run_timeout_secs = Some(1);
        let (_, executor) = executor(functions, config);
        let g = graph(
            vec![function_step("a", "slow"), function_step("b", "slow")],
            vec![Edge::new("a", "b", EdgeCondition::OnSuccess)],
        );

        let report = executor.execute_graph(&g, json!({})).await.unwrap();

        assert_eq!(report.error.unwrap().kind, ErrorKind::DeadlineExceeded);
        assert_eq!(report.execution_path, vec!["a"]);
    }

    #[tokio::test]
    async fn invalid_graph_is_rejected_before_start() {
        let (_, executor) = executor(ok_functions(), EngineConfig::default());
        let g = graph(
            vec![function_step("a", "ok")],
            vec![Edge::new("a", "ghost", EdgeCondition::Always)],
        );

        let err = executor.execute_graph(&g, json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Definition(_)));
    }

    // -- Plan mode --

    #[tokio::test]
    async fn every_third_step_is_checkpointed() {
        let mut config = EngineConfig::default();
        config.checkpoint.frequency = SaveFrequency::EveryNNodes { n: 3 };
        config.checkpoint.retention = RetentionPolicy::PruneOld { keep: 10 };
        let (_, executor) = executor(ok_functions(), config);

        let report = executor.execute_plan(&linear_plan(7, "ok"), json!({})).await.unwrap();

        assert!(report.is_success());
        let listed = executor.checkpoints().list(report.run_id()).await.unwrap();
        let counters: Vec<u64> = listed.iter().map(|m| m.step_counter).collect();
        assert_eq!(counters, vec![6, 3]);
    }

    #[tokio::test]
    async fn failed_dependency_leaves_no_executable_steps() {
        let mut functions = ok_functions();
        functions.register_sync("check", |_| Ok(json!({ "success": false, "error": "bad data" })));
        let (_, executor) = executor(functions, EngineConfig::default());
        let mut b = function_step("b", "ok");
        b.depends_on = vec!["a".into()];
        let plan = Plan {
            id: "p".into(),
            goal: String::new(),
            steps: vec![function_step("a", "check"), b, function_step("c", "ok")],
        };

        let report = executor.execute_plan(&plan, json!({})).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::NoExecutableSteps);
        assert!(error.is_terminal());
        assert_eq!(report.execution_path, vec!["a", "c"]);
        assert_eq!(report.run.metrics.success_count, 1);
    }

    #[tokio::test]
    async fn resume_skips_completed_steps() {
        let a_calls = Arc::new(AtomicU32::new(0));
        let b_calls = Arc::new(AtomicU32::new(0));
        let mut functions = ok_functions();
        counting(&mut functions, "a", &a_calls);
        let counter = Arc::clone(&b_calls);
        functions.register_sync("b", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Fault::PermissionDenied("token expired".into()).into())
            } else {
                Ok(json!({ "b": "done" }))
            }
        });
        let (_, executor) = executor(functions, EngineConfig::default());
        let mut plan = linear_plan(3, "ok");
        plan.steps[0].action = ActionSpec::Function {
            name: "a".into(),
            arguments: Map::new(),
        };
        plan.steps[1].action = ActionSpec::Function {
            name: "b".into(),
            arguments: Map::new(),
        };

        let first = executor.execute_plan(&plan, json!({ "seed": 1 })).await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);
        assert_eq!(first.error.as_ref().unwrap().kind, ErrorKind::SecurityError);
        assert!(first.run.narrative.as_deref().unwrap().contains("resumes at 's2'"));

        let resumed = executor.resume_plan(&plan, first.run_id()).await.unwrap();

        assert!(resumed.is_success());
        assert_ne!(resumed.run_id(), first.run_id());
        assert_eq!(resumed.run.input["resumed_from"], json!(first.run_id().to_string()));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
        assert_eq!(resumed.memory.get("seed"), Some(&json!(1)));
        assert!(resumed.execution_path.ends_with(&["s2".to_string(), "s3".to_string()]));
    }

    #[tokio::test]
    async fn resume_without_checkpoint_starts_from_entry() {
        let a_calls = Arc::new(AtomicU32::new(0));
        let b_calls = Arc::new(AtomicU32::new(0));
        let mut functions = FunctionRegistry::new();
        counting(&mut functions, "a", &a_calls);
        let counter = Arc::clone(&b_calls);
        functions.register_sync("b", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Fault::InvalidInput("bad payload".into()).into())
            } else {
                Ok(json!({}))
            }
        });
        let mut config = EngineConfig::default();
        config.checkpoint.enabled = false;
        let (_, executor) = executor(functions, config);
        let g = graph(
            vec![function_step("a", "a"), function_step("b", "b")],
            vec![Edge::new("a", "b", EdgeCondition::OnSuccess)],
        );

        let first = executor.execute_graph(&g, json!({ "x": 1 })).await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);
        assert!(first.run.narrative.as_deref().unwrap().contains("no checkpoint"));

        let resumed = executor.resume_graph(&g, first.run_id()).await.unwrap();
        assert!(resumed.is_success());
        assert_eq!(resumed.execution_path, vec!["a", "b"]);
        assert_eq!(a_calls.load(Ordering::SeqCst), 2);
        assert_eq!(resumed.memory.get("x"), Some(&json!(1)));

        let unknown = executor.resume_graph(&g, Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(unknown, ExecutorError::RunNotFound(_)));
    }

    // -- Fan-out --

    #[tokio::test]
    async fn fan_out_runs_are_isolated() {
        let mut functions = FunctionRegistry::new();
        functions.register("greet", |args| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let name = args.get("name").and_then(Value::as_str).unwrap_or("nobody").to_string();
            Ok(json!({ "greeting": format!("hello {name}") }))
        });
        let (_, executor) = executor(functions, EngineConfig::default());
        let executor = Arc::new(executor);
        let mut events = executor.event_bus().subscribe();
        let mut step = function_step("greet", "greet");
        step.input_keys = vec!["name".into()];
        let g = Arc::new(graph(vec![step], vec![]));

        let reports = executor
            .execute_many(vec![
                GraphRequest {
                    graph: Arc::clone(&g),
                    input: json!({ "name": "ada" }),
                },
                GraphRequest {
                    graph: Arc::clone(&g),
                    input: json!({ "name": "grace" }),
                },
            ])
            .await;

        assert_eq!(reports.len(), 2);
        let first = reports[0].as_ref().unwrap();
        let second = reports[1].as_ref().unwrap();
        assert_ne!(first.run_id(), second.run_id());
        assert_eq!(first.memory.get("greeting"), Some(&json!("hello ada")));
        assert_eq!(second.memory.get("greeting"), Some(&json!("hello grace")));
        assert!(first.memory.get("name") != second.memory.get("name"));

        let first_events = crate::event::drain_run(&mut events, first.run_id());
        assert!(matches!(first_events.first(), Some(RunEvent::RunStarted { .. })));
        assert!(matches!(first_events.last(), Some(RunEvent::RunCompleted { .. })));
        assert!(first_events.iter().all(|e| e.run_id() == first.run_id()));
    }

    #[test]
    fn executor_error_display() {
        let id = Uuid::now_v7();
        assert!(ExecutorError::RunNotFound(id).to_string().contains(&id.to_string()));
        let err = ExecutorError::InvalidCheckpoint {
            run_id: id,
            reason: "memory is not an object".into(),
        };
        assert!(err.to_string().contains("memory is not an object"));
    }

    #[test]
    fn narrative_names_kind_and_checkpoint() {
        let error = ExecutionError::new(ErrorKind::Timeout, "slow").with_context("step_id", "fetch");
        let mark = CheckpointMark {
            id: Uuid::now_v7(),
            node_id: "fetch".into(),
            step_counter: 4,
        };
        let text = failure_narrative(&error, Some(&mark));
        assert!(text.contains("TIMEOUT"));
        assert!(text.contains("at step 'fetch'"));
        assert!(text.contains("resumes at 'fetch' (step 4)"));
    }
}
