//! Per-run mutable state.
//!
//! `ExecutionContext` is owned by exactly one run. Concurrent Parallel
//! branches reach it only through the run's mutex, so writes are applied one
//! at a time. Once the run is terminal the context is folded into a frozen
//! [`RunSnapshot`] and dropped.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::ExecutionStatus;

/// Latest observed state of one task within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Attempts made during the latest execution.
    pub attempts: u32,
    /// How many times the task has been dequeued in this run.
    pub executions: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for TaskRecord {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            executions: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionContext {
    variables: HashMap<String, Value>,
    tasks: HashMap<String, TaskRecord>,
    /// Loop counters keyed by Iteration task ID.
    iterations: HashMap<String, u32>,
}

impl ExecutionContext {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self { variables, ..Self::default() }
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Last write wins.
    pub fn merge_variables(&mut self, writes: impl IntoIterator<Item = (String, Value)>) {
        self.variables.extend(writes);
    }

    pub fn task(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn task_status(&self, id: &str) -> ExecutionStatus {
        self.tasks.get(id).map_or(ExecutionStatus::Pending, |r| r.status)
    }

    /// Mark a task as dequeued and running; returns its previous status.
    pub fn start_task(&mut self, id: &str) -> ExecutionStatus {
        let record = self.tasks.entry(id.to_string()).or_default();
        let old = record.status;
        record.status = ExecutionStatus::Running;
        record.executions += 1;
        record.attempts = 0;
        record.error = None;
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        old
    }

    pub fn record_attempt(&mut self, id: &str, attempt: u32) {
        self.tasks.entry(id.to_string()).or_default().attempts = attempt;
    }

    /// Store the handler's result without finishing the task (control kinds
    /// finish after their branches or waits).
    pub fn record_result(&mut self, id: &str, result: Value) {
        self.tasks.entry(id.to_string()).or_default().result = Some(result);
    }

    /// Move a task to a terminal status; returns its previous status.
    pub fn finish_task(&mut self, id: &str, status: ExecutionStatus, error: Option<String>) -> ExecutionStatus {
        let record = self.tasks.entry(id.to_string()).or_default();
        let old = record.status;
        record.status = status;
        if error.is_some() {
            record.error = error;
        }
        record.finished_at = Some(Utc::now());
        old
    }

    pub fn iteration(&self, id: &str) -> u32 {
        self.iterations.get(id).copied().unwrap_or(0)
    }

    pub fn reset_iteration(&mut self, id: &str) {
        self.iterations.insert(id.to_string(), 0);
    }

    /// Increment the loop counter and return the new value.
    pub fn advance_iteration(&mut self, id: &str) -> u32 {
        let counter = self.iterations.entry(id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn snapshot(&self, header: RunHeader) -> RunSnapshot {
        RunSnapshot {
            run_id: header.run_id,
            workflow_id: header.workflow_id,
            status: header.status,
            error: header.error,
            started_at: header.started_at,
            finished_at: header.finished_at,
            variables: self.variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            tasks: self.tasks.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            iterations: self.iterations.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

/// Run-level fields of a snapshot, owned by the run rather than the context.
#[derive(Debug, Clone)]
pub struct RunHeader {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a run, returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub variables: BTreeMap<String, Value>,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub iterations: BTreeMap<String, u32>,
}

impl RunSnapshot {
    pub fn task(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    pub fn task_status(&self, id: &str) -> Option<ExecutionStatus> {
        self.tasks.get(id).map(|r| r.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variable_writes_are_last_write_wins() {
        let mut ctx = ExecutionContext::new(HashMap::from([("x".to_string(), json!(1))]));
        ctx.merge_variables([("x".to_string(), json!(2)), ("y".to_string(), json!("a"))]);
        ctx.merge_variables([("x".to_string(), json!(3))]);

        assert_eq!(ctx.variable("x"), Some(&json!(3)));
        assert_eq!(ctx.variable("y"), Some(&json!("a")));
    }

    #[test]
    fn task_lifecycle_tracks_previous_status() {
        let mut ctx = ExecutionContext::default();
        assert_eq!(ctx.start_task("a"), ExecutionStatus::Pending);
        ctx.record_attempt("a", 2);
        ctx.record_result("a", json!({ "ok": true }));
        assert_eq!(ctx.finish_task("a", ExecutionStatus::Completed, None), ExecutionStatus::Running);

        // Re-entering (e.g. inside a loop body) starts a fresh execution.
        assert_eq!(ctx.start_task("a"), ExecutionStatus::Completed);
        let record = ctx.task("a").unwrap();
        assert_eq!(record.executions, 2);
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn iteration_counters_reset_and_advance() {
        let mut ctx = ExecutionContext::default();
        assert_eq!(ctx.iteration("loop"), 0);
        assert_eq!(ctx.advance_iteration("loop"), 1);
        assert_eq!(ctx.advance_iteration("loop"), 2);
        ctx.reset_iteration("loop");
        assert_eq!(ctx.iteration("loop"), 0);
    }
}
