//! Task-level error type.

use thiserror::Error;

/// Errors returned by a handler's `execute` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Recoverable`: re-attempted with back-off while the retry budget lasts.
/// - `Timeout`: recoverable unless the task is marked non-idempotent.
/// - everything else fails the task on the first occurrence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Transient failure; the engine may re-attempt the task.
    #[error("recoverable task error: {0}")]
    Recoverable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("terminal task error: {0}")]
    Terminal(String),

    /// The task configuration could not be interpreted. Never retried.
    #[error("invalid task configuration: {0}")]
    InvalidConfig(String),

    /// The handler did not finish before its deadline.
    #[error("task exceeded its deadline")]
    Timeout,

    /// The handler panicked; caught at the engine boundary.
    #[error("task handler panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Whether the handler marked this error as safe to re-attempt.
    ///
    /// `Timeout` is reported as recoverable here; the engine downgrades it
    /// for tasks that are not idempotent.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_) | Self::Timeout)
    }
}
