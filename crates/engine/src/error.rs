//! Engine-level error types.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::models::{ExecutionStatus, TaskKind, VariableType};

// ------ Validation errors ------

/// A single problem found while loading a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// Two or more tasks share the same ID.
    #[error("duplicate task ID '{0}'")]
    DuplicateTaskId(String),

    /// Two or more variables share the same name.
    #[error("duplicate variable name '{0}'")]
    DuplicateVariableName(String),

    /// A variable's initial value does not fit its declared type.
    #[error("variable '{name}' is declared {expected} but its initial value is not")]
    VariableTypeMismatch { name: String, expected: VariableType },

    /// A task's configuration does not match the shape its kind requires.
    #[error("task '{task_id}' has invalid configuration: {message}")]
    InvalidTaskConfig { task_id: String, message: String },

    /// A successor reference names a task that does not exist.
    #[error("task '{task_id}' references unknown successor '{successor}'")]
    UnknownSuccessor { task_id: String, successor: String },

    /// Control-flow configuration that can never execute sensibly.
    #[error("task '{task_id}' has invalid control flow: {reason}")]
    InvalidControlFlow { task_id: String, reason: String },

    /// A cycle that is not closed by an Iteration construct.
    #[error("unbounded cycle through tasks [{}]", tasks.join(", "))]
    UnboundedCycle { tasks: Vec<String> },
}

/// Every violation found in a definition, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workflow definition is invalid ({} violation(s)): {}", violations.len(), render(violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ------ Engine errors ------

/// Errors produced when loading definitions or starting runs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No handler is registered for a task kind. Fatal for the run.
    #[error("no handler registered for task kind '{0}'")]
    UnknownTaskKind(TaskKind),

    #[error("unknown trigger '{0}'")]
    UnknownTrigger(String),

    #[error("trigger '{0}' is not active")]
    TriggerInactive(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ------ Run control errors ------

/// Errors returned by pause/resume/cancel and status queries. None of them
/// change run state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} is {status}; nothing to do")]
    NoOp { run_id: Uuid, status: ExecutionStatus },
}

// ------ Collaborator errors ------

/// Reported by a status publisher. Never faults a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("status channel closed")]
    Closed,
}

/// Reported by a definition store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("workflow definition {0} not found")]
    NotFound(Uuid),
}
