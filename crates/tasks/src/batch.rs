//! `BatchHandler`: splits an array variable into fixed-size chunks.
//!
//! `{ "source": "rows", "size": 100, "output_variable": "row_batches" }`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::traits::parse_config;
use crate::{TaskContext, TaskError, TaskHandler, TaskOutput};

#[derive(Debug, Deserialize)]
struct BatchSettings {
    source: String,
    size: usize,
    #[serde(default)]
    output_variable: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchHandler;

#[async_trait]
impl TaskHandler for BatchHandler {
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError> {
        let settings: BatchSettings = parse_config(config)?;
        if settings.size == 0 {
            return Err(TaskError::InvalidConfig("batch size must be positive".into()));
        }

        let items = match ctx.variable(&settings.source) {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(TaskError::Terminal(format!("variable '{}' is not an array", settings.source)))
            }
            None => return Err(TaskError::Terminal(format!("variable '{}' is not bound", settings.source))),
        };

        let chunks: Vec<Value> = items
            .chunks(settings.size)
            .map(|chunk| Value::Array(chunk.to_vec()))
            .collect();

        let mut output = TaskOutput::new(json!({ "batches": chunks.len(), "items": items.len() }));
        if let Some(name) = settings.output_variable {
            output = output.with_variable(name, Value::Array(chunks));
        }
        Ok(output)
    }
}
