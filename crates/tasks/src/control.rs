//! `ControlHandler`: the handler for kinds whose behaviour is pure control
//! flow (Conditional, Iteration, Parallel, Delay). The engine interprets
//! their configuration; the handler only marks the visit.

use async_trait::async_trait;
use serde_json::Value;

use crate::{TaskContext, TaskError, TaskHandler, TaskOutput};

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlHandler;

#[async_trait]
impl TaskHandler for ControlHandler {
    async fn execute(&self, _ctx: &TaskContext, _config: &Value) -> Result<TaskOutput, TaskError> {
        Ok(TaskOutput::empty())
    }
}
