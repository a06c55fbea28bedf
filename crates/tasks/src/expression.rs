//! JEXL expression evaluation over run variables.
//!
//! Used for Conditional predicates, ScriptExecution bodies and
//! DataTransformation assignments. Variables are passed as the context
//! object; they are never interpolated into the expression text.

use std::collections::HashMap;

use jexl_eval::Evaluator;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur during expression evaluation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression is empty")]
    Empty,
}

/// Evaluate `expression` against the given variable bindings.
pub fn evaluate(expression: &str, variables: &HashMap<String, Value>) -> Result<Value, ExpressionError> {
    if expression.trim().is_empty() {
        return Err(ExpressionError::Empty);
    }

    let context: Map<String, Value> = variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Evaluator::new()
        .eval_in_context(expression, &Value::Object(context))
        .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
}

/// Evaluate `expression` and coerce the result to a boolean.
pub fn evaluate_bool(expression: &str, variables: &HashMap<String, Value>) -> Result<bool, ExpressionError> {
    evaluate(expression, variables).map(|v| is_truthy(&v))
}

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Replace `{{ name }}` placeholders with variable values.
///
/// Strings are inserted verbatim, other values as compact JSON. Unknown
/// names are left untouched.
pub fn render_template(template: &str, variables: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let end = start + len + 2;
        let name = rest[start + 2..end - 2].trim();

        out.push_str(&rest[..start]);
        match variables.get(name) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}
