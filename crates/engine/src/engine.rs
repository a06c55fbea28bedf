//! `WorkflowEngine`: loads definitions, starts runs and answers control calls.
//!
//! Each run is traversed on its own tokio task. The engine keeps a table of
//! runs by ID; a terminal run stays in the table (as a frozen snapshot) until
//! the caller hands it to a store and calls [`WorkflowEngine::forget`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, instrument, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::RunSnapshot;
use crate::error::{ControlError, EngineError, ValidationError};
use crate::executor::{Executor, RunState};
use crate::graph::{self, ResolvedGraph};
use crate::models::{ExecutionStatus, TriggerContext, WorkflowDefinition};
use crate::publisher::{deliver, StatusEvent, StatusPublisher};
use crate::registry::TaskRegistry;

pub struct WorkflowEngine {
    registry: Arc<TaskRegistry>,
    publisher: Arc<dyn StatusPublisher>,
    config: Arc<EngineConfig>,
    runs: DashMap<Uuid, Arc<RunState>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("runs", &self.runs.len())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(registry: TaskRegistry, publisher: Arc<dyn StatusPublisher>, config: EngineConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            publisher,
            config: Arc::new(config),
            runs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate a definition into an executable graph.
    ///
    /// # Errors
    /// A [`ValidationError`] listing every violation found.
    #[instrument(skip_all, fields(workflow_id = %definition.id, tasks = definition.tasks.len()))]
    pub fn load(&self, definition: &WorkflowDefinition) -> Result<ResolvedGraph, ValidationError> {
        let graph = graph::validate(definition)?;
        info!(entries = ?graph.entries(), "definition loaded");
        Ok(graph)
    }

    /// Start a run and return its ID once it is `Running`.
    ///
    /// Declared initial values are bound first; `bindings` overwrite them by
    /// name.
    ///
    /// # Errors
    /// [`EngineError::UnknownTrigger`] or [`EngineError::TriggerInactive`]
    /// when the trigger is not eligible.
    #[instrument(skip_all, fields(workflow_id = %graph.workflow_id, trigger = ?trigger.trigger_id))]
    pub async fn start(
        &self,
        graph: Arc<ResolvedGraph>,
        bindings: HashMap<String, Value>,
        trigger: TriggerContext,
    ) -> Result<Uuid, EngineError> {
        graph.check_trigger(&trigger)?;

        let mut variables = graph.initial_variables().clone();
        variables.extend(bindings);

        let run_id = Uuid::now_v7();
        let run = Arc::new(RunState::new(run_id, graph, trigger, variables));
        self.runs.insert(run_id, Arc::clone(&run));

        run.transition(ExecutionStatus::Pending, ExecutionStatus::Running);
        self.publish_run(run_id, ExecutionStatus::Pending, ExecutionStatus::Running).await;
        info!(%run_id, "run started");

        let executor = Executor {
            run,
            registry: Arc::clone(&self.registry),
            publisher: Arc::clone(&self.publisher),
            config: Arc::clone(&self.config),
        };
        tokio::spawn(executor.run().in_current_span());

        Ok(run_id)
    }

    /// Validate and start in one call.
    pub async fn start_definition(
        &self,
        definition: &WorkflowDefinition,
        bindings: HashMap<String, Value>,
        trigger: TriggerContext,
    ) -> Result<Uuid, EngineError> {
        let graph = Arc::new(self.load(definition)?);
        self.start(graph, bindings, trigger).await
    }

    /// Start a run and wait for it to finish.
    pub async fn execute(
        &self,
        graph: Arc<ResolvedGraph>,
        bindings: HashMap<String, Value>,
        trigger: TriggerContext,
    ) -> Result<RunSnapshot, EngineError> {
        let run_id = self.start(graph, bindings, trigger).await?;
        Ok(self.wait(run_id).await?)
    }

    /// Suspend a Running run before its next task dequeue.
    ///
    /// # Errors
    /// [`ControlError::NoOp`] unless the run is Running.
    #[instrument(skip(self))]
    pub async fn pause(&self, run_id: Uuid) -> Result<(), ControlError> {
        self.run(run_id)?.request_pause()?;
        info!("run paused");
        self.publish_run(run_id, ExecutionStatus::Running, ExecutionStatus::Paused).await;
        Ok(())
    }

    /// # Errors
    /// [`ControlError::NoOp`] unless the run is Paused.
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: Uuid) -> Result<(), ControlError> {
        self.run(run_id)?.request_resume()?;
        info!("run resumed");
        self.publish_run(run_id, ExecutionStatus::Paused, ExecutionStatus::Running).await;
        Ok(())
    }

    /// Request cancellation. The run becomes Cancelled at its next safe
    /// point; a handler already executing is not interrupted.
    ///
    /// # Errors
    /// [`ControlError::NoOp`] when the run is terminal or already cancelling.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), ControlError> {
        self.run(run_id)?.request_cancel()?;
        info!("cancellation requested");
        Ok(())
    }

    /// Current snapshot. Stable once the run is terminal.
    pub fn status(&self, run_id: Uuid) -> Result<RunSnapshot, ControlError> {
        Ok(self.run(run_id)?.snapshot())
    }

    /// Wait until the run is terminal and return its final snapshot.
    pub async fn wait(&self, run_id: Uuid) -> Result<RunSnapshot, ControlError> {
        let run = self.run(run_id)?;
        Ok(run.wait().await)
    }

    /// IDs of every run the engine still holds.
    pub fn runs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop a terminal run and return its final snapshot.
    ///
    /// # Errors
    /// [`ControlError::NoOp`] while the run is still active.
    pub fn forget(&self, run_id: Uuid) -> Result<RunSnapshot, ControlError> {
        let run = self.run(run_id)?;
        if !run.is_retired() {
            return Err(ControlError::NoOp { run_id, status: run.status() });
        }
        self.runs.remove(&run_id);
        Ok(run.snapshot())
    }

    fn run(&self, run_id: Uuid) -> Result<Arc<RunState>, ControlError> {
        self.runs
            .get(&run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ControlError::RunNotFound(run_id))
    }

    async fn publish_run(&self, run_id: Uuid, old: ExecutionStatus, new: ExecutionStatus) {
        let event = StatusEvent {
            run_id,
            task_id: None,
            old,
            new,
            payload: Value::Null,
            at: Utc::now(),
        };
        deliver(self.publisher.as_ref(), self.config.publish_timeout(), event).await;
    }
}
