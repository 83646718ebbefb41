//! Append-only decision/outcome ledger for one run.
//!
//! Bookkeeping never fails the run: recording against a missing or closed
//! run logs a warning and returns an empty ID. Storage errors while
//! persisting the run record are logged the same way.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use stepwise_types::run::{
    Decision, DecisionOption, Outcome, Problem, Run, RunMetrics, RunStatus, Severity,
};
use uuid::Uuid;

use crate::repository::RunStorage;

/// Result payload recorded with an outcome.
#[derive(Debug, Clone)]
pub enum OutcomeResult {
    Success(Value),
    Failure(String),
}

/// Decision/outcome log scoped to a single run.
///
/// Decision IDs are dense in call order (`dec_0`, `dec_1`, ...), giving a
/// replay order that does not depend on wall-clock timestamps.
pub struct RunLedger<S: RunStorage> {
    storage: Arc<S>,
    run: Option<Run>,
}

impl<S: RunStorage> RunLedger<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage, run: None }
    }

    /// The run being recorded, open or closed.
    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    pub fn into_run(self) -> Option<Run> {
        self.run
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.run.as_ref().map(|r| r.id)
    }

    /// The open run, or `None` (with a warning) when there is nothing to record into.
    fn active(&mut self, op: &str) -> Option<&mut Run> {
        match self.run.as_mut() {
            Some(run) if run.status == RunStatus::Running => Some(run),
            Some(run) => {
                tracing::warn!(run_id = %run.id, status = %run.status, op, "ledger call on closed run ignored");
                None
            }
            None => {
                tracing::warn!(op, "ledger call with no active run ignored");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Open a run and persist its record.
    ///
    /// Calling this while a run is open returns the open run's ID.
    pub async fn start_run(&mut self, goal_id: &str, description: &str, input: Value) -> Uuid {
        if let Some(run) = &self.run {
            if run.status == RunStatus::Running {
                tracing::warn!(run_id = %run.id, "start_run called while a run is open");
                return run.id;
            }
        }

        let run = Run {
            id: Uuid::now_v7(),
            goal_id: goal_id.to_string(),
            description: description.to_string(),
            input,
            status: RunStatus::Running,
            decisions: Vec::new(),
            problems: Vec::new(),
            metrics: RunMetrics::default(),
            narrative: None,
            output: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        let run_id = run.id;
        tracing::info!(run_id = %run_id, goal_id, "run started");
        self.run = Some(run);
        self.persist().await;
        run_id
    }

    /// Close the run. Idempotent: a second call is a logged no-op.
    pub async fn end_run(&mut self, success: bool, narrative: &str, output: Option<Value>) {
        let Some(run) = self.active("end_run") else {
            return;
        };
        run.status = if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        run.narrative = Some(narrative.to_string());
        run.output = output;
        run.ended_at = Some(Utc::now());
        tracing::info!(
            run_id = %run.id,
            status = %run.status,
            decisions = run.decisions.len(),
            "run ended"
        );
        self.persist().await;
    }

    /// Write the current run record to storage.
    pub async fn persist(&self) {
        let Some(run) = &self.run else {
            return;
        };
        if let Err(e) = self.storage.save_run(run).await {
            tracing::warn!(run_id = %run.id, error = %e, "failed to persist run record");
        }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Record a decision. Returns its ID, or an empty string when no run is open.
    pub fn decide(
        &mut self,
        intent: &str,
        options: Vec<DecisionOption>,
        chosen: &str,
        reasoning: &str,
        node_id: Option<&str>,
        context: Value,
    ) -> String {
        let Some(run) = self.active("decide") else {
            return String::new();
        };
        let id = format!("dec_{}", run.decisions.len());
        run.decisions.push(Decision {
            id: id.clone(),
            node_id: node_id.map(str::to_string),
            intent: intent.to_string(),
            options,
            chosen: chosen.to_string(),
            reasoning: reasoning.to_string(),
            context,
            outcome: None,
            created_at: Utc::now(),
        });
        run.metrics.decision_count += 1;
        if node_id.is_some() {
            run.metrics.nodes_visited += 1;
        }
        tracing::debug!(run_id = %run.id, decision_id = %id, node_id, "decision recorded");
        id
    }

    /// Attach an outcome to a decision. Returns whether it was attached.
    ///
    /// Each decision takes exactly one outcome; duplicates are ignored.
    pub fn record_outcome(
        &mut self,
        decision_id: &str,
        result: OutcomeResult,
        tokens_used: u64,
        latency_ms: u64,
        state_changes: Vec<String>,
    ) -> bool {
        let Some(run) = self.active("record_outcome") else {
            return false;
        };
        let run_id = run.id;
        let Some(decision) = run.decisions.iter_mut().find(|d| d.id == decision_id) else {
            tracing::warn!(run_id = %run_id, decision_id, "outcome for unknown decision ignored");
            return false;
        };
        if decision.outcome.is_some() {
            tracing::warn!(run_id = %run_id, decision_id, "duplicate outcome ignored");
            return false;
        }

        let (success, result, error) = match result {
            OutcomeResult::Success(value) => (true, Some(value), None),
            OutcomeResult::Failure(error) => (false, None, Some(error)),
        };
        decision.outcome = Some(Outcome {
            success,
            result,
            error,
            tokens_used,
            latency_ms,
            state_changes,
            recorded_at: Utc::now(),
        });

        let metrics = &mut run.metrics;
        metrics.total_tokens += tokens_used;
        metrics.total_latency_ms += latency_ms;
        if success {
            metrics.success_count += 1;
        } else {
            metrics.failure_count += 1;
        }
        true
    }

    /// Record a problem. Returns its ID, or an empty string when no run is open.
    pub fn report_problem(
        &mut self,
        severity: Severity,
        description: &str,
        decision_id: Option<&str>,
        root_cause: Option<String>,
        suggested_fix: Option<String>,
    ) -> String {
        let Some(run) = self.active("report_problem") else {
            return String::new();
        };
        let id = format!("prob_{}", run.problems.len());
        tracing::debug!(run_id = %run.id, problem_id = %id, ?severity, description, "problem reported");
        run.problems.push(Problem {
            id: id.clone(),
            severity,
            description: description.to_string(),
            decision_id: decision_id.filter(|d| !d.is_empty()).map(str::to_string),
            root_cause,
            suggested_fix,
            reported_at: Utc::now(),
        });
        id
    }

    /// Count a retry against the run metrics.
    pub fn note_retry(&mut self) {
        if let Some(run) = self.active("note_retry") {
            run.metrics.retries += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRunStorage;
    use serde_json::json;

    fn ledger() -> (Arc<InMemoryRunStorage>, RunLedger<InMemoryRunStorage>) {
        let storage = Arc::new(InMemoryRunStorage::new());
        (storage.clone(), RunLedger::new(storage))
    }

    #[tokio::test]
    async fn decision_ids_are_dense() {
        let (_, mut ledger) = ledger();
        ledger.start_run("g", "demo", json!({})).await;

        let ids: Vec<String> = (0..3)
            .map(|i| ledger.decide("step", vec![], "run", "", Some(format!("s{i}").as_str()), json!({})))
            .collect();
        assert_eq!(ids, vec!["dec_0", "dec_1", "dec_2"]);
        assert_eq!(ledger.run().unwrap().metrics.decision_count, 3);
        assert_eq!(ledger.run().unwrap().metrics.nodes_visited, 3);
    }

    #[tokio::test]
    async fn outcome_attaches_once() {
        let (_, mut ledger) = ledger();
        ledger.start_run("g", "demo", json!({})).await;
        let id = ledger.decide("a", vec![], "run", "", Some("a"), json!({}));

        assert!(ledger.record_outcome(&id, OutcomeResult::Success(json!(1)), 10, 5, vec![]));
        assert!(!ledger.record_outcome(&id, OutcomeResult::Failure("late".into()), 99, 99, vec![]));

        let run = ledger.run().unwrap();
        let outcome = run.decision(&id).unwrap().outcome.as_ref().unwrap();
        assert!(outcome.success);
        assert_eq!(run.metrics.total_tokens, 10);
        assert_eq!(run.metrics.success_count, 1);
        assert_eq!(run.metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn calls_without_run_are_noops() {
        let (_, mut ledger) = ledger();
        assert_eq!(ledger.decide("a", vec![], "run", "", None, json!({})), "");
        assert!(!ledger.record_outcome("dec_0", OutcomeResult::Success(json!(null)), 0, 0, vec![]));
        assert_eq!(ledger.report_problem(Severity::Info, "x", None, None, None), "");
        ledger.end_run(true, "done", None).await;
        assert!(ledger.run().is_none());
    }

    #[tokio::test]
    async fn calls_after_end_run_do_not_mutate_closed_run() {
        let (storage, mut ledger) = ledger();
        let run_id = ledger.start_run("g", "demo", json!({"topic": "rust"})).await;
        let id = ledger.decide("a", vec![], "run", "", Some("a"), json!({}));
        ledger.record_outcome(&id, OutcomeResult::Success(json!("ok")), 1, 1, vec![]);
        ledger.end_run(true, "finished", Some(json!("ok"))).await;

        let before = serde_json::to_value(ledger.run().unwrap()).unwrap();

        assert_eq!(ledger.decide("b", vec![], "run", "", Some("b"), json!({})), "");
        assert!(!ledger.record_outcome("dec_1", OutcomeResult::Success(json!(1)), 1, 1, vec![]));
        assert_eq!(ledger.report_problem(Severity::Critical, "late", None, None, None), "");
        ledger.note_retry();
        ledger.end_run(false, "again", None).await;

        let after = serde_json::to_value(ledger.run().unwrap()).unwrap();
        assert_eq!(before, after);

        let stored = storage.load_run(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.narrative.as_deref(), Some("finished"));
    }

    #[tokio::test]
    async fn problems_reference_decisions() {
        let (_, mut ledger) = ledger();
        ledger.start_run("g", "demo", json!({})).await;
        let dec = ledger.decide("b", vec![], "run", "", Some("b"), json!({}));
        let prob = ledger.report_problem(
            Severity::Critical,
            "missing input",
            Some(&dec),
            Some("MISSING_DEPENDENCY".into()),
            None,
        );
        assert_eq!(prob, "prob_0");
        let run = ledger.run().unwrap();
        assert_eq!(run.problems[0].decision_id.as_deref(), Some("dec_0"));
    }

    #[tokio::test]
    async fn start_run_while_open_returns_same_id() {
        let (_, mut ledger) = ledger();
        let first = ledger.start_run("g", "demo", json!({})).await;
        let second = ledger.start_run("g", "demo", json!({})).await;
        assert_eq!(first, second);
    }
}
