//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory. They serialise to/from the JSON documents the definition store
//! and the CLI exchange.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// TaskKind
// ---------------------------------------------------------------------------

/// The fixed set of task kinds. Handlers are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    HttpCallout,
    ScriptExecution,
    DataTransformation,
    StoragePush,
    Conditional,
    Batch,
    Iteration,
    Parallel,
    Delay,
    Notification,
}

impl TaskKind {
    pub const ALL: [TaskKind; 10] = [
        Self::HttpCallout,
        Self::ScriptExecution,
        Self::DataTransformation,
        Self::StoragePush,
        Self::Conditional,
        Self::Batch,
        Self::Iteration,
        Self::Parallel,
        Self::Delay,
        Self::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpCallout        => "http_callout",
            Self::ScriptExecution    => "script_execution",
            Self::DataTransformation => "data_transformation",
            Self::StoragePush        => "storage_push",
            Self::Conditional        => "conditional",
            Self::Batch              => "batch",
            Self::Iteration          => "iteration",
            Self::Parallel           => "parallel",
            Self::Delay              => "delay",
            Self::Notification       => "notification",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown task kind: {s}"))
    }
}

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Status of a run or of a single task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, Failed and Cancelled never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Running   => write!(f, "running"),
            Self::Paused    => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed    => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "running"   => Ok(Self::Running),
            "paused"    => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// Canvas coordinates. Presentation only; the engine never reads them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// What happens when a task fails for good.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Keep the run going despite the failure.
    #[serde(default)]
    pub tolerate: bool,
    /// Task to continue with after a tolerated failure.
    #[serde(default)]
    pub next: Option<String>,
}

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique identifier within this workflow (referenced by successors).
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: TaskKind,
    /// Kind-specific configuration; successor references live here.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub position: Position,
    /// Overrides the engine's retry policy for this task.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Overrides the engine's default per-attempt deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Timeouts are not retried for non-idempotent tasks.
    #[serde(default)]
    pub non_idempotent: bool,
    #[serde(default)]
    pub on_failure: Option<FailurePolicy>,
}

impl TaskDefinition {
    /// Convenience constructor for testing.
    pub fn new(id: impl Into<String>, kind: TaskKind, config: Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            config,
            position: Position::default(),
            retry: None,
            timeout_ms: None,
            non_idempotent: false,
            on_failure: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    pub fn is_failure_tolerant(&self) -> bool {
        self.on_failure.as_ref().is_some_and(|p| p.tolerate)
    }
}

// ---------------------------------------------------------------------------
// VariableDefinition
// ---------------------------------------------------------------------------

/// Declared type tag of a workflow variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl VariableType {
    /// Whether `value` fits this tag. `null` fits every tag (unset).
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (Self::Any, _) => true,
            (Self::String, Value::String(_))
            | (Self::Number, Value::Number(_))
            | (Self::Boolean, Value::Bool(_))
            | (Self::Object, Value::Object(_))
            | (Self::Array, Value::Array(_)) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String  => "string",
            Self::Number  => "number",
            Self::Boolean => "boolean",
            Self::Object  => "object",
            Self::Array   => "array",
            Self::Any     => "any",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub initial: Value,
}

impl VariableDefinition {
    pub fn new(name: impl Into<String>, var_type: VariableType, initial: Value) -> Self {
        let name = name.into();
        Self { id: name.clone(), name, var_type, initial }
    }
}

// ---------------------------------------------------------------------------
// TriggerDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Schedule,
    Event,
}

/// How a workflow may be started. Only consulted at run start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: TriggerKind,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Identifies what started a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerContext {
    /// `None` for a manual start.
    #[serde(default)]
    pub trigger_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl TriggerContext {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn fired(trigger_id: impl Into<String>, payload: Value) -> Self {
        Self { trigger_id: Some(trigger_id.into()), payload }
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: String::new(),
            tasks,
            variables: Vec::new(),
            triggers: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_variables(mut self, variables: Vec<VariableDefinition>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_triggers(mut self, triggers: Vec<TriggerDefinition>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Declared initial values keyed by variable name.
    pub fn initial_variables(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .map(|v| (v.name.clone(), v.initial.clone()))
            .collect()
    }
}
