//! Run traversal.
//!
//! A run walks its resolved graph as a worklist seeded with the entry tasks:
//! 1. Check the pause/cancel signal before each dequeue.
//! 2. Resolve the handler and execute it under the retry wrapper, with a
//!    per-attempt deadline and panics caught at the boundary.
//! 3. Record the result, merge variable writes, and pick successors by the
//!    task's control-flow kind.
//! 4. On failure, follow the task's failure policy or halt the run.
//!
//! Parallel branches and Iteration bodies are walked as nested segments that
//! stop at a target task (the join successor, or the Iteration task itself).
//! All context writes go through the run's single mutex.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tasks::{expression, TaskContext, TaskError, TaskHandler, TaskOutput};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{ExecutionContext, RunHeader, RunSnapshot};
use crate::error::ControlError;
use crate::graph::{Flow, ResolvedGraph, ResolvedTask};
use crate::models::{ExecutionStatus, TriggerContext};
use crate::publisher::{deliver, StatusEvent, StatusPublisher};
use crate::registry::TaskRegistry;
use crate::retry::{run_with_retry, RetryOutcome};
use crate::signal::RunSignal;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Everything the engine keeps about one run.
pub(crate) struct RunState {
    pub run_id: Uuid,
    pub graph: Arc<ResolvedGraph>,
    pub trigger: TriggerContext,
    pub signal: RunSignal,
    started_at: DateTime<Utc>,
    status: watch::Sender<ExecutionStatus>,
    /// Set once the traversal has passed its last safe point. Only touched
    /// under the status channel's lock.
    finishing: AtomicBool,
    /// `None` once the run is terminal.
    context: Mutex<Option<ExecutionContext>>,
    final_snapshot: OnceLock<RunSnapshot>,
}

impl RunState {
    pub fn new(
        run_id: Uuid,
        graph: Arc<ResolvedGraph>,
        trigger: TriggerContext,
        variables: HashMap<String, Value>,
    ) -> Self {
        let (status, _) = watch::channel(ExecutionStatus::Pending);
        Self {
            run_id,
            graph,
            trigger,
            signal: RunSignal::new(),
            started_at: Utc::now(),
            status,
            finishing: AtomicBool::new(false),
            context: Mutex::new(Some(ExecutionContext::new(variables))),
            final_snapshot: OnceLock::new(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    /// Move from `from` to `to`; false when the run is somewhere else.
    pub fn transition(&self, from: ExecutionStatus, to: ExecutionStatus) -> bool {
        self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        })
    }

    fn no_op(&self) -> ControlError {
        ControlError::NoOp { run_id: self.run_id, status: self.status() }
    }

    pub fn request_pause(&self) -> Result<(), ControlError> {
        let paused = self.status.send_if_modified(|status| {
            if *status != ExecutionStatus::Running || self.finishing.load(Ordering::Relaxed) {
                return false;
            }
            *status = ExecutionStatus::Paused;
            self.signal.pause();
            true
        });
        if !paused {
            return Err(self.no_op());
        }
        Ok(())
    }

    pub fn request_resume(&self) -> Result<(), ControlError> {
        let resumed = self.status.send_if_modified(|status| {
            if *status != ExecutionStatus::Paused {
                return false;
            }
            *status = ExecutionStatus::Running;
            self.signal.resume();
            true
        });
        if !resumed {
            return Err(self.no_op());
        }
        Ok(())
    }

    /// Only raises the signal; the traversal records `Cancelled` when it
    /// next reaches a safe point. `NoOp` once no safe point is left.
    pub fn request_cancel(&self) -> Result<(), ControlError> {
        let mut raised = false;
        self.status.send_if_modified(|status| {
            if !status.is_terminal() && !self.finishing.load(Ordering::Relaxed) && !self.signal.is_cancelled() {
                self.signal.cancel();
                raised = true;
            }
            false
        });
        if !raised {
            return Err(self.no_op());
        }
        Ok(())
    }

    /// Claim completion after the last safe point. False when a cancel or
    /// pause got in first.
    fn seal(&self) -> bool {
        let mut sealed = false;
        self.status.send_if_modified(|status| {
            if *status == ExecutionStatus::Running && !self.signal.is_cancelled() {
                self.finishing.store(true, Ordering::Relaxed);
                sealed = true;
            }
            false
        });
        sealed
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut ExecutionContext) -> R) -> Option<R> {
        lock(&self.context).as_mut().map(f)
    }

    fn header(&self, status: ExecutionStatus, error: Option<String>, finished_at: Option<DateTime<Utc>>) -> RunHeader {
        RunHeader {
            run_id: self.run_id,
            workflow_id: self.graph.workflow_id,
            status,
            error,
            started_at: self.started_at,
            finished_at,
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        if let Some(frozen) = self.final_snapshot.get() {
            return frozen.clone();
        }
        let guard = lock(&self.context);
        match guard.as_ref() {
            Some(ctx) => ctx.snapshot(self.header(self.status(), None, None)),
            // Retired between the two checks; the frozen copy is set by now.
            None => self
                .final_snapshot
                .get()
                .cloned()
                .unwrap_or_else(|| ExecutionContext::default().snapshot(self.header(self.status(), None, None))),
        }
    }

    /// Freeze the snapshot, drop the context and publish the terminal status.
    /// Returns the status the run left.
    fn retire(&self, status: ExecutionStatus, error: Option<String>) -> Option<ExecutionStatus> {
        {
            let mut guard = lock(&self.context);
            let ctx = guard.take().unwrap_or_default();
            let frozen = ctx.snapshot(self.header(status, error, Some(Utc::now())));
            let _ = self.final_snapshot.set(frozen);
        }

        let mut old = None;
        self.status.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            old = Some(*current);
            *current = status;
            true
        });
        old
    }

    pub fn is_retired(&self) -> bool {
        self.final_snapshot.get().is_some() && self.status().is_terminal()
    }

    pub async fn wait(&self) -> RunSnapshot {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(ExecutionStatus::is_terminal).await;
        self.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

/// Why a segment stopped early.
#[derive(Debug)]
enum Halt {
    /// `task_id` failed and its failure was not absorbed. `fatal` failures
    /// (no handler registered) bypass every failure policy.
    Failed { task_id: String, message: String, fatal: bool },
    Cancelled,
}

impl Halt {
    fn is_fatal(&self) -> bool {
        matches!(self, Halt::Failed { fatal: true, .. })
    }
}

type Segment = BoxFuture<'static, Result<(), Halt>>;

fn with_stop(stops: &Arc<Vec<String>>, extra: Option<&str>) -> Arc<Vec<String>> {
    match extra {
        Some(id) if !stops.iter().any(|s| s == id) => {
            let mut extended = stops.as_ref().clone();
            extended.push(id.to_string());
            Arc::new(extended)
        }
        _ => Arc::clone(stops),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drives one run. Cheap to clone; Parallel branches each get a copy.
#[derive(Clone)]
pub(crate) struct Executor {
    pub run: Arc<RunState>,
    pub registry: Arc<TaskRegistry>,
    pub publisher: Arc<dyn StatusPublisher>,
    pub config: Arc<EngineConfig>,
}

impl Executor {
    #[instrument(name = "run", skip_all, fields(run_id = %self.run.run_id, workflow_id = %self.run.graph.workflow_id))]
    pub async fn run(self) {
        let entries = self.run.graph.entries().to_vec();
        info!(tasks = self.run.graph.len(), ?entries, "traversal started");

        let outcome = self.walk(entries, Arc::new(Vec::new())).await;
        let (status, error) = match outcome {
            // A paused run is not declared finished until it is resumed.
            Ok(()) => loop {
                if self.run.signal.checkpoint().await.is_err() {
                    break (ExecutionStatus::Cancelled, None);
                }
                if self.run.seal() {
                    break (ExecutionStatus::Completed, None);
                }
            },
            Err(Halt::Cancelled) => (ExecutionStatus::Cancelled, None),
            Err(Halt::Failed { task_id, message, .. }) => {
                (ExecutionStatus::Failed, Some(format!("task '{task_id}' failed: {message}")))
            }
        };
        self.finish(status, error).await;
    }

    async fn finish(&self, status: ExecutionStatus, error: Option<String>) {
        match (&status, &error) {
            (ExecutionStatus::Failed, Some(e)) => error!("run failed: {e}"),
            (ExecutionStatus::Cancelled, _) => warn!("run cancelled"),
            _ => info!(%status, "run finished"),
        }
        let payload = error.as_ref().map_or(Value::Null, |e| json!({ "error": e }));
        if let Some(old) = self.run.retire(status, error) {
            self.emit(None, old, status, payload).await;
        }
    }

    async fn emit(&self, task_id: Option<&str>, old: ExecutionStatus, new: ExecutionStatus, payload: Value) {
        let event = StatusEvent {
            run_id: self.run.run_id,
            task_id: task_id.map(str::to_string),
            old,
            new,
            payload,
            at: Utc::now(),
        };
        deliver(self.publisher.as_ref(), self.config.publish_timeout(), event).await;
    }

    /// Walk from `entries` until the worklist drains. Tasks in `stops` are
    /// dropped instead of executed; the enclosing construct owns them.
    fn walk(&self, entries: Vec<String>, stops: Arc<Vec<String>>) -> Segment {
        let this = self.clone();
        async move {
            let mut worklist: VecDeque<String> = entries.into();
            while let Some(task_id) = worklist.pop_front() {
                if stops.contains(&task_id) {
                    continue;
                }
                this.run.signal.checkpoint().await.map_err(|_| Halt::Cancelled)?;
                let successors = this.step(&task_id, &stops).await?;
                worklist.extend(successors);
            }
            Ok(())
        }
        .boxed()
    }

    /// Execute one task and return the successors to enqueue.
    async fn step(&self, task_id: &str, stops: &Arc<Vec<String>>) -> Result<Vec<String>, Halt> {
        let graph = Arc::clone(&self.run.graph);
        let Some(task) = graph.task(task_id) else {
            return Err(Halt::Failed {
                task_id: task_id.to_string(),
                message: "task is not part of the workflow".into(),
                fatal: true,
            });
        };

        let old = self
            .run
            .with_context(|ctx| ctx.start_task(task_id))
            .unwrap_or(ExecutionStatus::Pending);
        self.emit(Some(task_id), old, ExecutionStatus::Running, Value::Null).await;
        debug!(task_id, kind = %task.kind(), "task started");

        let handler = match self.registry.resolve(task.kind()) {
            Ok(handler) => handler,
            Err(e) => {
                error!(task_id, "{e}");
                self.settle(task_id, ExecutionStatus::Failed, Some(e.to_string())).await;
                return Err(Halt::Failed { task_id: task_id.to_string(), message: e.to_string(), fatal: true });
            }
        };

        let TaskOutput { result, variables } = match self.invoke(task, handler).await {
            RetryOutcome::Succeeded { value, attempts } => {
                debug!(task_id, attempts, "handler succeeded");
                value
            }
            RetryOutcome::Failed { error, attempts } => {
                return self.fail_task(task, format!("{error} (attempt {attempts})")).await;
            }
            RetryOutcome::Cancelled { .. } => return self.cancel_task(task_id).await,
        };
        self.run.with_context(|ctx| {
            ctx.record_result(task_id, result);
            ctx.merge_variables(variables);
        });

        match &task.flow {
            Flow::Linear { next } => {
                self.settle(task_id, ExecutionStatus::Completed, None).await;
                Ok(next.iter().cloned().collect())
            }

            Flow::Conditional { condition, on_true, on_false } => {
                let bindings = self.run.with_context(|ctx| ctx.variables().clone()).unwrap_or_default();
                match expression::evaluate_bool(condition, &bindings) {
                    Ok(branch) => {
                        debug!(task_id, branch, "condition evaluated");
                        self.run.with_context(|ctx| ctx.record_result(task_id, json!({ "condition": branch })));
                        self.settle(task_id, ExecutionStatus::Completed, None).await;
                        let chosen = if branch { on_true } else { on_false };
                        Ok(chosen.iter().cloned().collect())
                    }
                    Err(e) => self.fail_task(task, e.to_string()).await,
                }
            }

            Flow::Delay { duration, next } => {
                debug!(task_id, ?duration, "waiting");
                if self.run.signal.sleep(*duration).await.is_err() {
                    return self.cancel_task(task_id).await;
                }
                self.settle(task_id, ExecutionStatus::Completed, None).await;
                Ok(next.iter().cloned().collect())
            }

            Flow::Parallel { branches, next } => self.fan_out(task, branches, next.as_deref(), stops).await,

            Flow::Iteration { count, body, next } => {
                self.iterate(task, *count, body.as_deref(), next.as_deref(), stops).await
            }
        }
    }

    /// One handler invocation under the retry policy, deadline and panic guard.
    async fn invoke(&self, task: &ResolvedTask, handler: Arc<dyn TaskHandler>) -> RetryOutcome<TaskOutput> {
        let definition = &task.definition;
        let policy = self.config.retry_policy_for(definition);
        let timeout = self.config.task_timeout(definition);
        let non_idempotent = definition.non_idempotent;

        let retryable = move |e: &TaskError| match e {
            TaskError::Timeout => !non_idempotent,
            other => other.is_recoverable(),
        };

        run_with_retry(&policy, &self.run.signal, task.id(), retryable, |attempt| {
            let handler = Arc::clone(&handler);
            let config = definition.config.clone();
            let ctx = self.task_context(task.id(), attempt, timeout);
            async move {
                let guarded = AssertUnwindSafe(handler.execute(&ctx, &config)).catch_unwind();
                match tokio::time::timeout(timeout, guarded).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
                    Err(_) => Err(TaskError::Timeout),
                }
            }
        })
        .await
    }

    fn task_context(&self, task_id: &str, attempt: u32, timeout: Duration) -> TaskContext {
        let variables = self
            .run
            .with_context(|ctx| {
                ctx.record_attempt(task_id, attempt);
                ctx.variables().clone()
            })
            .unwrap_or_default();

        TaskContext {
            workflow_id: self.run.graph.workflow_id,
            run_id: self.run.run_id,
            task_id: task_id.to_string(),
            attempt,
            variables,
            trigger_payload: self.run.trigger.payload.clone(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Record a terminal task status and publish the transition.
    async fn settle(&self, task_id: &str, status: ExecutionStatus, error: Option<String>) {
        let payload = match &error {
            Some(e) => json!({ "error": e }),
            None => Value::Null,
        };
        let (old, payload) = self
            .run
            .with_context(|ctx| {
                let payload = match ctx.task(task_id).and_then(|r| r.result.clone()) {
                    Some(result) if payload.is_null() => result,
                    _ => payload.clone(),
                };
                (ctx.finish_task(task_id, status, error), payload)
            })
            .unwrap_or((ExecutionStatus::Running, Value::Null));
        self.emit(Some(task_id), old, status, payload).await;
    }

    async fn cancel_task(&self, task_id: &str) -> Result<Vec<String>, Halt> {
        debug!(task_id, "cancelled at suspension point");
        self.settle(task_id, ExecutionStatus::Cancelled, None).await;
        Err(Halt::Cancelled)
    }

    /// Mark the task Failed, then either continue along its failure
    /// successor or halt the enclosing segment.
    async fn fail_task(&self, task: &ResolvedTask, message: String) -> Result<Vec<String>, Halt> {
        let task_id = task.id();
        self.settle(task_id, ExecutionStatus::Failed, Some(message.clone())).await;

        match &task.definition.on_failure {
            Some(policy) if policy.tolerate => {
                warn!(task_id, next = ?policy.next, "task failed, continuing: {message}");
                Ok(policy.next.iter().cloned().collect())
            }
            _ => {
                error!(task_id, "task failed: {message}");
                Err(Halt::Failed { task_id: task_id.to_string(), message, fatal: false })
            }
        }
    }

    /// Run every branch concurrently and wait for all of them at the join.
    async fn fan_out(
        &self,
        task: &ResolvedTask,
        branches: &[String],
        join: Option<&str>,
        stops: &Arc<Vec<String>>,
    ) -> Result<Vec<String>, Halt> {
        let task_id = task.id();
        let branch_stops = with_stop(stops, join);

        let mut set = JoinSet::new();
        for branch in branches {
            let name = branch.clone();
            let segment = self.walk(vec![branch.clone()], Arc::clone(&branch_stops));
            set.spawn(async move { (name, segment.await) }.in_current_span());
        }
        debug!(task_id, branches = branches.len(), "fan-out started");

        // Siblings are never aborted; every branch runs to its own end.
        let mut failure: Option<Halt> = None;
        let mut cancelled = false;
        while let Some(joined) = set.join_next().await {
            let (branch, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => (
                    task_id.to_string(),
                    Err(Halt::Failed { task_id: task_id.to_string(), message: format!("branch worker died: {e}"), fatal: false }),
                ),
            };
            match outcome {
                Ok(()) => debug!(task_id, %branch, "branch finished"),
                Err(Halt::Cancelled) => cancelled = true,
                Err(halt) => {
                    warn!(task_id, %branch, "branch failed");
                    failure = match failure {
                        Some(prev) if prev.is_fatal() || !halt.is_fatal() => Some(prev),
                        _ => Some(halt),
                    };
                }
            }
        }

        match failure {
            Some(Halt::Failed { task_id: culprit, message, fatal: true }) => {
                self.settle(task_id, ExecutionStatus::Failed, Some(format!("branch task '{culprit}' failed: {message}")))
                    .await;
                Err(Halt::Failed { task_id: culprit, message, fatal: true })
            }
            Some(Halt::Failed { task_id: culprit, message, .. }) => {
                self.fail_task(task, format!("branch task '{culprit}' failed: {message}")).await
            }
            _ if cancelled => self.cancel_task(task_id).await,
            _ => {
                if self.run.signal.checkpoint().await.is_err() {
                    return self.cancel_task(task_id).await;
                }
                self.settle(task_id, ExecutionStatus::Completed, None).await;
                Ok(join.map(str::to_string).into_iter().collect())
            }
        }
    }

    /// Walk the body `count` times, then hand over to the after-loop successor.
    async fn iterate(
        &self,
        task: &ResolvedTask,
        count: u32,
        body: Option<&str>,
        after: Option<&str>,
        stops: &Arc<Vec<String>>,
    ) -> Result<Vec<String>, Halt> {
        let task_id = task.id();
        let body_stops = with_stop(stops, Some(task_id));
        self.run.with_context(|ctx| ctx.reset_iteration(task_id));

        loop {
            let pass = self
                .run
                .with_context(|ctx| (ctx.iteration(task_id) < count).then(|| ctx.advance_iteration(task_id)))
                .flatten();
            let Some(pass) = pass else { break };
            debug!(task_id, pass, count, "iteration pass");

            let Some(body) = body else { continue };
            match self.walk(vec![body.to_string()], Arc::clone(&body_stops)).await {
                Ok(()) => {}
                Err(Halt::Cancelled) => return self.cancel_task(task_id).await,
                Err(Halt::Failed { task_id: culprit, message, fatal: true }) => {
                    self.settle(task_id, ExecutionStatus::Failed, Some(format!("task '{culprit}' failed: {message}")))
                        .await;
                    return Err(Halt::Failed { task_id: culprit, message, fatal: true });
                }
                Err(Halt::Failed { task_id: culprit, message, .. }) => {
                    return self
                        .fail_task(task, format!("task '{culprit}' failed in pass {pass}: {message}"))
                        .await;
                }
            }
        }

        self.run.with_context(|ctx| ctx.record_result(task_id, json!({ "iterations": count })));
        self.settle(task_id, ExecutionStatus::Completed, None).await;
        Ok(after.map(str::to_string).into_iter().collect())
    }
}
