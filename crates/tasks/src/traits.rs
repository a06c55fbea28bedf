//! The `TaskHandler` trait: the contract every task kind's handler must fulfil.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::TaskError;

/// Per-invocation view of the run handed to a handler.
///
/// Defined here (in the tasks crate) so both the engine and individual
/// handlers can import it without a circular dependency. `variables` is a
/// snapshot taken right before the attempt; handlers write back through
/// [`TaskOutput::variables`], never directly.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// ID of the workflow definition being run.
    pub workflow_id: Uuid,
    /// ID of the current run.
    pub run_id: Uuid,
    /// ID of the task being executed.
    pub task_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Variable bindings at the start of this attempt.
    pub variables: HashMap<String, Value>,
    /// Payload supplied by the trigger that started the run.
    pub trigger_payload: Value,
    /// The engine abandons the attempt once this instant passes.
    pub deadline: Instant,
}

impl TaskContext {
    /// Time left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// Successful result of a handler invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    /// Recorded as the task's result in the run context.
    pub result: Value,
    /// Variables to merge into the run context (last write wins).
    pub variables: HashMap<String, Value>,
}

impl TaskOutput {
    pub fn new(result: Value) -> Self {
        Self { result, variables: HashMap::new() }
    }

    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    /// Add a variable write to the output.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// The core handler trait.
///
/// Handlers must not block indefinitely: long operations should be bounded
/// by [`TaskContext::remaining`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute one attempt of a task with its kind-specific configuration.
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError>;
}

/// Deserialize a handler's settings out of the task configuration payload.
pub fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T, TaskError> {
    serde_json::from_value(config.clone()).map_err(|e| TaskError::InvalidConfig(e.to_string()))
}
