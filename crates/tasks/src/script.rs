//! `ScriptHandler` and `TransformHandler` - JEXL-backed computation.
//!
//! A script is a single expression evaluated against the run variables:
//! `{ "script": "items|length > 0 && total * 1.2", "output_variable": "gross" }`.
//!
//! A transformation assigns several variables at once; assignments run in
//! key order and each sees the writes of the ones before it:
//! `{ "assign": { "subtotal": "price * qty", "total": "subtotal + shipping" } }`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::expression::evaluate;
use crate::traits::parse_config;
use crate::{TaskContext, TaskError, TaskHandler, TaskOutput};

#[derive(Debug, Deserialize)]
struct ScriptSettings {
    script: String,
    #[serde(default)]
    output_variable: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptHandler;

#[async_trait]
impl TaskHandler for ScriptHandler {
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError> {
        let settings: ScriptSettings = parse_config(config)?;
        let value = evaluate(&settings.script, &ctx.variables)
            .map_err(|e| TaskError::Terminal(e.to_string()))?;

        let mut output = TaskOutput::new(value.clone());
        if let Some(name) = settings.output_variable {
            output = output.with_variable(name, value);
        }
        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct TransformSettings {
    assign: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransformHandler;

#[async_trait]
impl TaskHandler for TransformHandler {
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError> {
        let settings: TransformSettings = parse_config(config)?;
        if settings.assign.is_empty() {
            return Err(TaskError::InvalidConfig("`assign` has no entries".into()));
        }

        let mut scope = ctx.variables.clone();
        let mut assigned = Map::new();
        for (name, expression) in &settings.assign {
            let value = evaluate(expression, &scope)
                .map_err(|e| TaskError::Terminal(format!("assigning '{name}': {e}")))?;
            scope.insert(name.clone(), value.clone());
            assigned.insert(name.clone(), value);
        }

        let variables = assigned.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(TaskOutput {
            result: Value::Object(assigned),
            variables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use serde_json::json;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn ctx(pairs: &[(&str, Value)]) -> TaskContext {
        TaskContext {
            workflow_id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            task_id: "t".into(),
            attempt: 1,
            variables: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<HashMap<_, _>>(),
            trigger_payload: Value::Null,
            deadline: Instant::now() + Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn script_result_lands_in_output_variable() {
        let out = ScriptHandler
            .execute(&ctx(&[("n", json!(2))]), &json!({ "script": "n * 21", "output_variable": "answer" }))
            .await
            .unwrap();
        assert_eq!(out.result.as_f64(), Some(42.0));
        assert_eq!(out.variables.get("answer").and_then(Value::as_f64), Some(42.0));
    }

    #[tokio::test]
    async fn broken_script_is_terminal() {
        let err = ScriptHandler
            .execute(&ctx(&[]), &json!({ "script": "1 +" }))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Terminal(_)));
    }

    #[tokio::test]
    async fn transform_assignments_see_earlier_writes() {
        let out = TransformHandler
            .execute(
                &ctx(&[("price", json!(3)), ("qty", json!(2))]),
                &json!({ "assign": { "a_subtotal": "price * qty", "b_total": "a_subtotal + 1" } }),
            )
            .await
            .unwrap();
        assert_eq!(out.variables.get("a_subtotal").and_then(Value::as_f64), Some(6.0));
        assert_eq!(out.variables.get("b_total").and_then(Value::as_f64), Some(7.0));
    }

    #[tokio::test]
    async fn transform_without_assignments_is_invalid() {
        let err = TransformHandler.execute(&ctx(&[]), &json!({ "assign": {} })).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidConfig(_)));
    }
}
