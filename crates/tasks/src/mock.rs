//! `MockHandler`: a test double for `TaskHandler`.
//!
//! Useful in unit and integration tests where a real handler is either
//! unavailable or irrelevant.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{TaskContext, TaskError, TaskHandler, TaskOutput};

/// Behaviour injected into `MockHandler` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with the given error.
    Fail(TaskError),
    /// Panic with the given message.
    Panic(String),
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub task_id: String,
    pub attempt: u32,
    pub config: Value,
    pub variables: HashMap<String, Value>,
}

/// A mock handler that records every call it receives and plays back a
/// programmer-specified script of outcomes.
///
/// Outcomes are consumed in order; the last one repeats forever.
#[derive(Clone)]
pub struct MockHandler {
    /// Label used in test assertions.
    pub name: String,
    script: Arc<Mutex<VecDeque<MockBehaviour>>>,
    writes: HashMap<String, Value>,
    latency: Option<Duration>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockHandler {
    /// Create a mock that plays back `script` in order.
    pub fn scripted(name: impl Into<String>, script: Vec<MockBehaviour>) -> Self {
        Self {
            name: name.into(),
            script: Arc::new(Mutex::new(script.into())),
            writes: HashMap::new(),
            latency: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::scripted(name, vec![MockBehaviour::ReturnValue(value)])
    }

    /// Create a mock that always fails with a `Terminal` error.
    pub fn failing_terminal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::scripted(name, vec![MockBehaviour::Fail(TaskError::Terminal(msg.into()))])
    }

    /// Create a mock that always fails with a `Recoverable` error.
    pub fn failing_recoverable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::scripted(name, vec![MockBehaviour::Fail(TaskError::Recoverable(msg.into()))])
    }

    /// Create a mock that fails recoverably `failures` times, then succeeds.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        let mut script: Vec<MockBehaviour> = (0..failures)
            .map(|i| MockBehaviour::Fail(TaskError::Recoverable(format!("transient failure #{}", i + 1))))
            .collect();
        script.push(MockBehaviour::ReturnValue(value));
        Self::scripted(name, script)
    }

    /// Create a mock that panics on every call.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::scripted(name, vec![MockBehaviour::Panic(msg.into())])
    }

    /// Write `value` into `variable` on every successful call.
    pub fn writing(mut self, variable: impl Into<String>, value: Value) -> Self {
        self.writes.insert(variable.into(), value);
        self
    }

    /// Sleep for `latency` before producing the outcome.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of times this handler has been executed.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// All recorded calls in call order.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Task IDs in call order.
    pub fn task_order(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.task_id.clone()).collect()
    }

    /// Number of calls made for a specific task.
    pub fn calls_for(&self, task_id: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.task_id == task_id).count()
    }

    fn next_behaviour(&self) -> MockBehaviour {
        let mut script = lock(&self.script);
        if script.len() > 1 {
            script.pop_front().unwrap_or(MockBehaviour::ReturnValue(Value::Null))
        } else {
            script.front().cloned().unwrap_or(MockBehaviour::ReturnValue(Value::Null))
        }
    }
}

#[async_trait]
impl TaskHandler for MockHandler {
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError> {
        lock(&self.calls).push(MockCall {
            task_id: ctx.task_id.clone(),
            attempt: ctx.attempt,
            config: config.clone(),
            variables: ctx.variables.clone(),
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.next_behaviour() {
            MockBehaviour::ReturnValue(v) => {
                // Tag the output with the handler and task so tests can trace it.
                let mut out = json!({ "handler": self.name, "task": ctx.task_id });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(TaskOutput {
                    result: out,
                    variables: self.writes.clone(),
                })
            }
            MockBehaviour::Fail(err) => Err(err),
            MockBehaviour::Panic(msg) => panic!("{msg}"),
        }
    }
}
