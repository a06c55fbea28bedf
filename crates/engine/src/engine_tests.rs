//! End-to-end tests for run traversal and run control.
//!
//! Handlers are `MockHandler`s (or the built-in control handler), so no
//! network or storage is involved. Every test runs on a paused tokio clock;
//! delays and back-off advance instantly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tasks::mock::MockHandler;
use tasks::{TaskContext, TaskError, TaskHandler, TaskOutput};

use crate::{
    ChannelPublisher, ControlError, EngineConfig, EngineError, ExecutionStatus, FailurePolicy,
    NoopPublisher, RetryPolicy, RunSnapshot, TaskDefinition, TaskKind, TaskRegistry,
    TriggerContext, TriggerDefinition, TriggerKind, VariableDefinition, VariableType,
    WorkflowDefinition, WorkflowEngine,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Dispatches on task ID so one kind can behave differently per task.
#[derive(Clone)]
struct Routed {
    routes: HashMap<String, MockHandler>,
    fallback: MockHandler,
}

impl Routed {
    fn new(routes: &[(&str, MockHandler)]) -> Self {
        Self {
            routes: routes.iter().map(|(id, h)| (id.to_string(), h.clone())).collect(),
            fallback: MockHandler::returning("fallback", json!({})),
        }
    }
}

#[async_trait]
impl TaskHandler for Routed {
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError> {
        self.routes.get(&ctx.task_id).unwrap_or(&self.fallback).execute(ctx, config).await
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(10), 2.0),
        ..EngineConfig::default()
    }
}

fn engine_with(handlers: Vec<(TaskKind, Arc<dyn TaskHandler>)>) -> WorkflowEngine {
    let mut registry = TaskRegistry::with_builtins();
    for (kind, handler) in handlers {
        registry.register(kind, handler);
    }
    WorkflowEngine::new(registry, Arc::new(NoopPublisher), test_config())
}

fn task(id: &str, kind: TaskKind, config: Value) -> TaskDefinition {
    TaskDefinition::new(id, kind, config)
}

async fn run(engine: &WorkflowEngine, definition: &WorkflowDefinition) -> RunSnapshot {
    run_with(engine, definition, HashMap::new()).await
}

async fn run_with(
    engine: &WorkflowEngine,
    definition: &WorkflowDefinition,
    bindings: HashMap<String, Value>,
) -> RunSnapshot {
    let graph = Arc::new(engine.load(definition).expect("definition should load"));
    engine
        .execute(graph, bindings, TriggerContext::manual())
        .await
        .expect("run should start")
}

// ============================================================
// Control flow
// ============================================================

#[tokio::test(start_paused = true)]
async fn conditional_true_takes_true_branch_only() {
    let http = MockHandler::returning("http", json!({ "status": 200 }));
    let notify = MockHandler::returning("notify", json!({}));
    let engine = engine_with(vec![
        (TaskKind::HttpCallout, Arc::new(http.clone())),
        (TaskKind::Notification, Arc::new(notify.clone())),
    ]);

    let def = WorkflowDefinition::new(
        "branch",
        vec![
            task("a", TaskKind::HttpCallout, json!({ "next": "b" })),
            task("b", TaskKind::Conditional, json!({ "condition": "approved", "on_true": "c", "on_false": "d" })),
            task("c", TaskKind::Notification, json!({})),
            task("d", TaskKind::Notification, json!({})),
        ],
    )
    .with_variables(vec![VariableDefinition::new("approved", VariableType::Boolean, json!(true))]);

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(http.task_order(), ["a"]);
    assert_eq!(notify.task_order(), ["c"]);
    assert_eq!(snapshot.task_status("b"), Some(ExecutionStatus::Completed));
    assert_eq!(snapshot.task("b").unwrap().result, Some(json!({ "condition": true })));
    assert!(snapshot.task("d").is_none(), "false branch must never run");
}

#[tokio::test(start_paused = true)]
async fn conditional_sees_variables_written_upstream() {
    let score = MockHandler::returning("score", json!({})).writing("score", json!(12));
    let notify = MockHandler::returning("notify", json!({}));
    let engine = engine_with(vec![
        (TaskKind::ScriptExecution, Arc::new(score)),
        (TaskKind::Notification, Arc::new(notify.clone())),
    ]);

    let def = WorkflowDefinition::new(
        "threshold",
        vec![
            task("score", TaskKind::ScriptExecution, json!({ "next": "gate" })),
            task("gate", TaskKind::Conditional, json!({ "condition": "score > 50", "on_true": "high", "on_false": "low" })),
            task("high", TaskKind::Notification, json!({})),
            task("low", TaskKind::Notification, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(notify.task_order(), ["low"]);
    assert_eq!(snapshot.variables["score"], json!(12));
}

#[tokio::test(start_paused = true)]
async fn unparsable_condition_fails_the_task() {
    let engine = engine_with(vec![]);
    let def = WorkflowDefinition::new(
        "broken",
        vec![
            task("gate", TaskKind::Conditional, json!({ "condition": "1 +", "on_true": "t" })),
            task("t", TaskKind::Notification, json!({ "message": "unreachable" })),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.task_status("gate"), Some(ExecutionStatus::Failed));
    assert!(snapshot.task("t").is_none());
}

#[tokio::test(start_paused = true)]
async fn iteration_runs_body_exactly_count_times() {
    let work = MockHandler::returning("work", json!({}));
    let notify = MockHandler::returning("notify", json!({}));
    let engine = engine_with(vec![
        (TaskKind::ScriptExecution, Arc::new(work.clone())),
        (TaskKind::Notification, Arc::new(notify.clone())),
    ]);

    let def = WorkflowDefinition::new(
        "loop",
        vec![
            task("loop", TaskKind::Iteration, json!({ "count": 3, "body": "work", "next": "done" })),
            task("work", TaskKind::ScriptExecution, json!({ "next": "loop" })),
            task("done", TaskKind::Notification, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(work.calls_for("work"), 3);
    assert_eq!(notify.calls_for("done"), 1);
    assert_eq!(snapshot.iterations["loop"], 3);
    assert_eq!(snapshot.task("work").unwrap().executions, 3);
}

#[tokio::test(start_paused = true)]
async fn iteration_with_zero_count_skips_body() {
    let work = MockHandler::returning("work", json!({}));
    let notify = MockHandler::returning("notify", json!({}));
    let engine = engine_with(vec![
        (TaskKind::ScriptExecution, Arc::new(work.clone())),
        (TaskKind::Notification, Arc::new(notify.clone())),
    ]);

    let def = WorkflowDefinition::new(
        "empty-loop",
        vec![
            task("loop", TaskKind::Iteration, json!({ "count": 0, "body": "work", "next": "done" })),
            task("work", TaskKind::ScriptExecution, json!({ "next": "loop" })),
            task("done", TaskKind::Notification, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(work.call_count(), 0);
    assert_eq!(notify.calls_for("done"), 1);
}

#[tokio::test(start_paused = true)]
async fn failure_inside_loop_body_fails_the_iteration() {
    let routed = Routed::new(&[("step", MockHandler::failing_terminal("step", "bad row"))]);
    let engine = engine_with(vec![(TaskKind::DataTransformation, Arc::new(routed))]);

    let def = WorkflowDefinition::new(
        "loop-fail",
        vec![
            task("loop", TaskKind::Iteration, json!({ "count": 5, "body": "step", "next": "after" })),
            task("step", TaskKind::DataTransformation, json!({ "next": "loop" })),
            task("after", TaskKind::DataTransformation, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.task_status("loop"), Some(ExecutionStatus::Failed));
    assert_eq!(snapshot.iterations["loop"], 1);
    assert!(snapshot.task("after").is_none());
}

// ============================================================
// Parallel
// ============================================================

#[tokio::test(start_paused = true)]
async fn join_successor_runs_once_after_every_branch() {
    let notify = MockHandler::returning("notify", json!({})).with_latency(Duration::from_millis(50));
    let engine = engine_with(vec![(TaskKind::Notification, Arc::new(notify.clone()))]);

    let def = WorkflowDefinition::new(
        "fan",
        vec![
            task("fan", TaskKind::Parallel, json!({ "branches": ["x", "y", "z"], "next": "join" })),
            task("x", TaskKind::Notification, json!({ "next": "join" })),
            task("y", TaskKind::Notification, json!({ "next": "join" })),
            task("z", TaskKind::Notification, json!({})),
            task("join", TaskKind::Notification, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(notify.calls_for("join"), 1);
    assert_eq!(notify.task_order().last().map(String::as_str), Some("join"));
    for branch in ["x", "y", "z"] {
        assert_eq!(snapshot.task_status(branch), Some(ExecutionStatus::Completed));
    }
}

#[tokio::test(start_paused = true)]
async fn branch_failure_fails_run_but_sibling_result_is_kept() {
    let routed = Routed::new(&[
        ("x", MockHandler::returning("x", json!({ "rows": 10 })).with_latency(Duration::from_millis(100))),
        ("y", MockHandler::failing_terminal("y", "syntax error")),
    ]);
    let engine = engine_with(vec![(TaskKind::ScriptExecution, Arc::new(routed))]);

    let def = WorkflowDefinition::new(
        "fan-fail",
        vec![
            task("fan", TaskKind::Parallel, json!({ "branches": ["x", "y"], "next": "after" })),
            task("x", TaskKind::ScriptExecution, json!({})),
            task("y", TaskKind::ScriptExecution, json!({})),
            task("after", TaskKind::ScriptExecution, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.task_status("y"), Some(ExecutionStatus::Failed));
    assert_eq!(snapshot.task_status("fan"), Some(ExecutionStatus::Failed));
    // The slower sibling was allowed to finish.
    assert_eq!(snapshot.task_status("x"), Some(ExecutionStatus::Completed));
    assert_eq!(snapshot.task("x").unwrap().result.as_ref().unwrap()["rows"], 10);
    assert!(snapshot.task("after").is_none());
    assert!(snapshot.error.as_deref().unwrap().contains("syntax error"));
}

#[tokio::test(start_paused = true)]
async fn branches_write_into_the_shared_context() {
    let routed = Routed::new(&[
        ("x", MockHandler::returning("x", json!({})).writing("left", json!("L"))),
        ("y", MockHandler::returning("y", json!({})).writing("right", json!("R"))),
    ]);
    let engine = engine_with(vec![(TaskKind::DataTransformation, Arc::new(routed))]);

    let def = WorkflowDefinition::new(
        "fan-write",
        vec![
            task("fan", TaskKind::Parallel, json!({ "branches": ["x", "y"] })),
            task("x", TaskKind::DataTransformation, json!({})),
            task("y", TaskKind::DataTransformation, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.variables["left"], "L");
    assert_eq!(snapshot.variables["right"], "R");
}

#[tokio::test(start_paused = true)]
async fn parallel_inside_loop_body_joins_once_per_pass() {
    let work = MockHandler::returning("work", json!({}));
    let notify = MockHandler::returning("notify", json!({}));
    let engine = engine_with(vec![
        (TaskKind::ScriptExecution, Arc::new(work.clone())),
        (TaskKind::Notification, Arc::new(notify.clone())),
    ]);

    // loop ⇄ fan(x, y) → join → loop ; loop → done
    let def = WorkflowDefinition::new(
        "loop-fan",
        vec![
            task("loop", TaskKind::Iteration, json!({ "count": 2, "body": "fan", "next": "done" })),
            task("fan", TaskKind::Parallel, json!({ "branches": ["x", "y"], "next": "join" })),
            task("x", TaskKind::ScriptExecution, json!({})),
            task("y", TaskKind::ScriptExecution, json!({ "next": "join" })),
            task("join", TaskKind::ScriptExecution, json!({ "next": "loop" })),
            task("done", TaskKind::Notification, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.iterations["loop"], 2);
    assert_eq!(snapshot.task("fan").unwrap().executions, 2);
    assert_eq!(work.calls_for("x"), 2);
    assert_eq!(work.calls_for("y"), 2);
    assert_eq!(work.calls_for("join"), 2);
    assert_eq!(notify.calls_for("done"), 1);
    assert_eq!(snapshot.task("loop").unwrap().executions, 1);
}

#[tokio::test(start_paused = true)]
async fn inner_branch_reaching_outer_join_does_not_run_it_early() {
    let notify = MockHandler::returning("notify", json!({})).with_latency(Duration::from_millis(20));
    let engine = engine_with(vec![(TaskKind::Notification, Arc::new(notify.clone()))]);

    //  outer ─┬─ inner ─┬─ a ──────────┐
    //         │         └─ b           │
    //         │   inner → mid ─────────┤
    //         └─ z ────────────────────┴─ join
    let def = WorkflowDefinition::new(
        "nested-fan",
        vec![
            task("outer", TaskKind::Parallel, json!({ "branches": ["inner", "z"], "next": "join" })),
            task("inner", TaskKind::Parallel, json!({ "branches": ["a", "b"], "next": "mid" })),
            task("a", TaskKind::Notification, json!({ "next": "join" })),
            task("b", TaskKind::Notification, json!({})),
            task("mid", TaskKind::Notification, json!({ "next": "join" })),
            task("z", TaskKind::Notification, json!({ "next": "join" })),
            task("join", TaskKind::Notification, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    for id in ["a", "b", "mid", "z", "join"] {
        assert_eq!(notify.calls_for(id), 1, "{id} should run exactly once");
    }
    assert_eq!(notify.task_order().last().map(String::as_str), Some("join"));
    assert_eq!(snapshot.task("inner").unwrap().executions, 1);
}

#[tokio::test(start_paused = true)]
async fn pause_during_fan_out_holds_branches_and_join() {
    let notify = MockHandler::returning("notify", json!({})).with_latency(Duration::from_millis(100));
    let engine = engine_with(vec![(TaskKind::Notification, Arc::new(notify.clone()))]);

    let def = WorkflowDefinition::new(
        "paused-fan",
        vec![
            task("fan", TaskKind::Parallel, json!({ "branches": ["x", "y"], "next": "join" })),
            task("x", TaskKind::Notification, json!({ "next": "x2" })),
            task("x2", TaskKind::Notification, json!({})),
            task("y", TaskKind::Notification, json!({})),
            task("join", TaskKind::Notification, json!({})),
        ],
    );
    let graph = Arc::new(engine.load(&def).unwrap());
    let run_id = engine.start(graph, HashMap::new(), TriggerContext::manual()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(notify.call_count(), 2, "both branches are in flight");
    engine.pause(run_id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let paused = engine.status(run_id).unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    // In-flight handlers finish; nothing new is dequeued.
    assert_eq!(paused.task_status("x"), Some(ExecutionStatus::Completed));
    assert_eq!(paused.task_status("y"), Some(ExecutionStatus::Completed));
    assert_eq!(notify.calls_for("x2"), 0);
    assert_eq!(notify.calls_for("join"), 0);

    engine.resume(run_id).await.unwrap();
    let snapshot = engine.wait(run_id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(notify.calls_for("x2"), 1);
    assert_eq!(notify.calls_for("join"), 1);
}

// ============================================================
// Retry, timeout, panics
// ============================================================

#[tokio::test(start_paused = true)]
async fn flaky_callout_recovers_on_third_attempt() {
    let http = MockHandler::flaky("http", 2, json!({ "status": 200 }));
    let engine = engine_with(vec![(TaskKind::HttpCallout, Arc::new(http.clone()))]);

    let def = WorkflowDefinition::new(
        "flaky",
        vec![task("call", TaskKind::HttpCallout, json!({}))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(100), 2.0))],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    let record = snapshot.task("call").unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.attempts, 3);
    assert_eq!(http.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_with_last_error() {
    let http = MockHandler::flaky("http", 5, json!({}));
    let engine = engine_with(vec![(TaskKind::HttpCallout, Arc::new(http.clone()))]);

    let def = WorkflowDefinition::new("exhausted", vec![task("call", TaskKind::HttpCallout, json!({}))]);
    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    let record = snapshot.task("call").unwrap();
    assert_eq!(record.attempts, 3);
    assert!(record.error.as_deref().unwrap().contains("transient failure #3"));
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_retried_only_for_idempotent_tasks() {
    let slow = MockHandler::returning("slow", json!({})).with_latency(Duration::from_secs(10));
    let engine = engine_with(vec![(TaskKind::HttpCallout, Arc::new(slow.clone()))]);

    let mut idempotent = task("get", TaskKind::HttpCallout, json!({}));
    idempotent.timeout_ms = Some(1_000);
    let snapshot = run(&engine, &WorkflowDefinition::new("get", vec![idempotent])).await;
    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.task("get").unwrap().attempts, 3);

    let mut post = task("post", TaskKind::HttpCallout, json!({}));
    post.timeout_ms = Some(1_000);
    post.non_idempotent = true;
    let snapshot = run(&engine, &WorkflowDefinition::new("post", vec![post])).await;
    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.task("post").unwrap().attempts, 1);
    assert_eq!(slow.calls_for("post"), 1);
}

#[tokio::test(start_paused = true)]
async fn handler_panic_becomes_terminal_task_failure() {
    let boom = MockHandler::panicking("boom", "index out of bounds");
    let engine = engine_with(vec![(TaskKind::Batch, Arc::new(boom.clone()))]);

    let def = WorkflowDefinition::new("panic", vec![task("chunk", TaskKind::Batch, json!({}))]);
    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    let record = snapshot.task("chunk").unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("index out of bounds"));
    assert_eq!(boom.call_count(), 1, "panics are never retried");
}

// ============================================================
// Failure tolerance and fatal errors
// ============================================================

#[tokio::test(start_paused = true)]
async fn tolerated_failure_continues_along_failure_successor() {
    let routed = Routed::new(&[("push", MockHandler::failing_terminal("push", "rejected"))]);
    let notify = MockHandler::returning("notify", json!({}));
    let engine = engine_with(vec![
        (TaskKind::StoragePush, Arc::new(routed)),
        (TaskKind::Notification, Arc::new(notify.clone())),
    ]);

    let def = WorkflowDefinition::new(
        "tolerant",
        vec![
            task("push", TaskKind::StoragePush, json!({ "next": "ok" })).with_failure_policy(FailurePolicy {
                tolerate: true,
                next: Some("alert".into()),
            }),
            task("ok", TaskKind::Notification, json!({})),
            task("alert", TaskKind::Notification, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.task_status("push"), Some(ExecutionStatus::Failed));
    assert_eq!(notify.task_order(), ["alert"]);
}

#[tokio::test(start_paused = true)]
async fn tolerated_failure_without_successor_ends_that_path() {
    let routed = Routed::new(&[("x", MockHandler::failing_terminal("x", "nope"))]);
    let engine = engine_with(vec![(TaskKind::ScriptExecution, Arc::new(routed))]);

    let def = WorkflowDefinition::new(
        "tolerant-branch",
        vec![
            task("fan", TaskKind::Parallel, json!({ "branches": ["x", "y"], "next": "after" })),
            task("x", TaskKind::ScriptExecution, json!({ "next": "after" }))
                .with_failure_policy(FailurePolicy { tolerate: true, next: None }),
            task("y", TaskKind::ScriptExecution, json!({ "next": "after" })),
            task("after", TaskKind::ScriptExecution, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.task_status("x"), Some(ExecutionStatus::Failed));
    assert_eq!(snapshot.task_status("after"), Some(ExecutionStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn unknown_task_kind_fails_run_despite_tolerance() {
    let engine = WorkflowEngine::new(TaskRegistry::new(), Arc::new(NoopPublisher), test_config());
    let def = WorkflowDefinition::new(
        "unregistered",
        vec![
            task("push", TaskKind::StoragePush, json!({})).with_failure_policy(FailurePolicy {
                tolerate: true,
                next: Some("fallback".into()),
            }),
            task("fallback", TaskKind::StoragePush, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert!(snapshot.error.as_deref().unwrap().contains("no handler registered"));
    assert!(snapshot.task("fallback").is_none());
    assert_eq!(snapshot.task("push").unwrap().attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_task_kind_inside_branch_is_not_absorbed() {
    let mut registry = TaskRegistry::with_builtins();
    registry.register(TaskKind::Notification, Arc::new(MockHandler::returning("n", json!({}))));
    let engine = WorkflowEngine::new(registry, Arc::new(NoopPublisher), test_config());

    let def = WorkflowDefinition::new(
        "fatal-branch",
        vec![
            task("fan", TaskKind::Parallel, json!({ "branches": ["ok", "store"] }))
                .with_failure_policy(FailurePolicy { tolerate: true, next: None }),
            task("ok", TaskKind::Notification, json!({})),
            task("store", TaskKind::StoragePush, json!({})),
        ],
    );

    let snapshot = run(&engine, &def).await;

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.task_status("ok"), Some(ExecutionStatus::Completed));
    assert_eq!(snapshot.task_status("fan"), Some(ExecutionStatus::Failed));
}

// ============================================================
// Run lifecycle
// ============================================================

#[tokio::test(start_paused = true)]
async fn zero_task_workflow_completes_immediately() {
    let engine = engine_with(vec![]);
    let snapshot = run(&engine, &WorkflowDefinition::new("empty", vec![])).await;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert!(snapshot.tasks.is_empty());
    assert!(snapshot.finished_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_delay_skips_successor() {
    let notify = MockHandler::returning("notify", json!({}));
    let engine = engine_with(vec![(TaskKind::Notification, Arc::new(notify.clone()))]);

    let def = WorkflowDefinition::new(
        "delayed",
        vec![
            task("wait", TaskKind::Delay, json!({ "duration_ms": 60_000, "next": "after" })),
            task("after", TaskKind::Notification, json!({})),
        ],
    );
    let graph = Arc::new(engine.load(&def).unwrap());
    let run_id = engine.start(graph, HashMap::new(), TriggerContext::manual()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(engine.status(run_id).unwrap().task_status("wait"), Some(ExecutionStatus::Running));

    engine.cancel(run_id).await.unwrap();
    let snapshot = engine.wait(run_id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Cancelled);
    assert_eq!(snapshot.task_status("wait"), Some(ExecutionStatus::Cancelled));
    assert_eq!(notify.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn pause_holds_traversal_until_resume() {
    let notify = MockHandler::returning("notify", json!({}));
    let engine = engine_with(vec![(TaskKind::Notification, Arc::new(notify.clone()))]);

    let def = WorkflowDefinition::new(
        "pausable",
        vec![
            task("a", TaskKind::Notification, json!({ "next": "b" })),
            task("b", TaskKind::Notification, json!({})),
        ],
    );
    let graph = Arc::new(engine.load(&def).unwrap());
    let run_id = engine.start(graph, HashMap::new(), TriggerContext::manual()).await.unwrap();

    engine.pause(run_id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(engine.status(run_id).unwrap().status, ExecutionStatus::Paused);
    assert_eq!(notify.call_count(), 0);

    engine.resume(run_id).await.unwrap();
    let snapshot = engine.wait(run_id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(notify.task_order(), ["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn pause_during_backoff_holds_the_next_attempt() {
    let http = MockHandler::flaky("http", 2, json!({ "status": 200 }));
    let engine = engine_with(vec![(TaskKind::HttpCallout, Arc::new(http.clone()))]);

    let def = WorkflowDefinition::new(
        "backoff",
        vec![task("call", TaskKind::HttpCallout, json!({}))
            .with_retry(RetryPolicy::new(3, Duration::from_secs(10), 1.0))],
    );
    let graph = Arc::new(engine.load(&def).unwrap());
    let run_id = engine.start(graph, HashMap::new(), TriggerContext::manual()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(http.call_count(), 1);
    engine.pause(run_id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(engine.status(run_id).unwrap().status, ExecutionStatus::Paused);
    assert_eq!(http.call_count(), 1, "no attempt while paused");

    engine.resume(run_id).await.unwrap();
    let snapshot = engine.wait(run_id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.task("call").unwrap().attempts, 3);
    assert_eq!(http.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_paused_cancels() {
    let engine = engine_with(vec![]);
    let def = WorkflowDefinition::new(
        "paused-cancel",
        vec![task("n", TaskKind::Notification, json!({ "message": "hi" }))],
    );
    let graph = Arc::new(engine.load(&def).unwrap());
    let run_id = engine.start(graph, HashMap::new(), TriggerContext::manual()).await.unwrap();

    engine.pause(run_id).await.unwrap();
    engine.cancel(run_id).await.unwrap();

    let snapshot = engine.wait(run_id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Cancelled);
    assert!(snapshot.task("n").is_none());
}

#[tokio::test(start_paused = true)]
async fn terminal_snapshot_is_stable() {
    let engine = engine_with(vec![]);
    let def = WorkflowDefinition::new(
        "stable",
        vec![task("t", TaskKind::DataTransformation, json!({ "assign": { "total": "2 + 3" } }))],
    );

    let first = run(&engine, &def).await;
    let run_id = first.run_id;

    assert_eq!(engine.status(run_id).unwrap(), first);
    assert_eq!(engine.status(run_id).unwrap(), engine.status(run_id).unwrap());
    assert_eq!(engine.wait(run_id).await.unwrap(), first);
}

#[tokio::test(start_paused = true)]
async fn bindings_overwrite_declared_initial_values() {
    let inspector = MockHandler::returning("inspect", json!({}));
    let engine = engine_with(vec![(TaskKind::ScriptExecution, Arc::new(inspector.clone()))]);

    let def = WorkflowDefinition::new("bind", vec![task("p", TaskKind::ScriptExecution, json!({}))])
        .with_variables(vec![
            VariableDefinition::new("region", VariableType::String, json!("eu")),
            VariableDefinition::new("limit", VariableType::Number, json!(10)),
        ]);

    let bindings = HashMap::from([("region".to_string(), json!("us")), ("extra".to_string(), json!(true))]);
    run_with(&engine, &def, bindings).await;

    let seen = &inspector.calls()[0].variables;
    assert_eq!(seen["region"], "us");
    assert_eq!(seen["limit"], 10);
    assert_eq!(seen["extra"], true);
}

// ============================================================
// Publisher
// ============================================================

#[tokio::test(start_paused = true)]
async fn every_transition_is_published() {
    let (publisher, mut events) = ChannelPublisher::new();
    let engine = WorkflowEngine::new(TaskRegistry::with_builtins(), Arc::new(publisher), test_config());

    let def = WorkflowDefinition::new(
        "observed",
        vec![task("t", TaskKind::DataTransformation, json!({ "assign": { "x": "1" } }))],
    );
    let snapshot = run(&engine, &def).await;
    assert_eq!(snapshot.status, ExecutionStatus::Completed);

    let mut seen = Vec::new();
    for _ in 0..4 {
        let event = events.recv().await.unwrap();
        assert_eq!(event.run_id, snapshot.run_id);
        seen.push((event.task_id, event.old, event.new));
    }

    use ExecutionStatus::*;
    assert_eq!(
        seen,
        vec![
            (None, Pending, Running),
            (Some("t".to_string()), Pending, Running),
            (Some("t".to_string()), Running, Completed),
            (None, Running, Completed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn closed_publisher_never_faults_a_run() {
    let (publisher, events) = ChannelPublisher::new();
    drop(events);
    let engine = WorkflowEngine::new(TaskRegistry::with_builtins(), Arc::new(publisher), test_config());

    let def = WorkflowDefinition::new("deaf", vec![task("t", TaskKind::Notification, json!({ "message": "x" }))]);
    assert_eq!(run(&engine, &def).await.status, ExecutionStatus::Completed);
}

// ============================================================
// Control errors and triggers
// ============================================================

#[tokio::test(start_paused = true)]
async fn control_calls_report_not_found_and_no_op() {
    let engine = engine_with(vec![]);
    let ghost = uuid::Uuid::now_v7();
    assert_eq!(engine.pause(ghost).await, Err(ControlError::RunNotFound(ghost)));
    assert_eq!(engine.status(ghost).unwrap_err(), ControlError::RunNotFound(ghost));

    let def = WorkflowDefinition::new(
        "ctl",
        vec![task("wait", TaskKind::Delay, json!({ "duration_ms": 10_000 }))],
    );
    let graph = Arc::new(engine.load(&def).unwrap());
    let run_id = engine.start(graph, HashMap::new(), TriggerContext::manual()).await.unwrap();

    assert!(matches!(engine.resume(run_id).await, Err(ControlError::NoOp { .. })));
    engine.pause(run_id).await.unwrap();
    assert!(matches!(engine.pause(run_id).await, Err(ControlError::NoOp { .. })));
    engine.resume(run_id).await.unwrap();
    assert!(matches!(engine.forget(run_id), Err(ControlError::NoOp { .. })));

    let snapshot = engine.wait(run_id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);

    assert!(matches!(
        engine.cancel(run_id).await,
        Err(ControlError::NoOp { status: ExecutionStatus::Completed, .. })
    ));
    assert_eq!(engine.forget(run_id).unwrap(), snapshot);
    assert_eq!(engine.status(run_id).unwrap_err(), ControlError::RunNotFound(run_id));
}

#[tokio::test(start_paused = true)]
async fn second_cancel_is_a_no_op() {
    let engine = engine_with(vec![]);
    let def = WorkflowDefinition::new("c2", vec![task("wait", TaskKind::Delay, json!({ "duration_ms": 5_000 }))]);
    let graph = Arc::new(engine.load(&def).unwrap());
    let run_id = engine.start(graph, HashMap::new(), TriggerContext::manual()).await.unwrap();

    engine.cancel(run_id).await.unwrap();
    assert!(matches!(engine.cancel(run_id).await, Err(ControlError::NoOp { .. })));
    assert_eq!(engine.wait(run_id).await.unwrap().status, ExecutionStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn trigger_eligibility_is_checked_at_start() {
    let engine = engine_with(vec![]);
    let trigger = |id: &str, active: bool| TriggerDefinition {
        id: id.into(),
        name: id.into(),
        kind: TriggerKind::Webhook,
        config: Value::Null,
        active,
    };
    let def = WorkflowDefinition::new("hooked", vec![])
        .with_triggers(vec![trigger("live", true), trigger("off", false)]);
    let graph = Arc::new(engine.load(&def).unwrap());

    let fired = |id: &str| TriggerContext::fired(id, json!({ "order": 7 }));
    assert!(matches!(
        engine.start(Arc::clone(&graph), HashMap::new(), fired("off")).await,
        Err(EngineError::TriggerInactive(id)) if id == "off"
    ));
    assert!(matches!(
        engine.start(Arc::clone(&graph), HashMap::new(), fired("nope")).await,
        Err(EngineError::UnknownTrigger(_))
    ));
    assert!(engine.start(graph, HashMap::new(), fired("live")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn invalid_definition_is_rejected_before_any_run() {
    let engine = engine_with(vec![]);
    let def = WorkflowDefinition::new(
        "cyclic",
        vec![
            task("a", TaskKind::Notification, json!({ "next": "b" })),
            task("b", TaskKind::Notification, json!({ "next": "a" })),
        ],
    );

    let err = engine
        .start_definition(&def, HashMap::new(), TriggerContext::manual())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(engine.runs().is_empty());
}
