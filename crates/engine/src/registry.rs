//! Task handler registry.
//!
//! Maps each [`TaskKind`] to the handler that executes it. The surrounding
//! system extends coverage by registering handlers at startup; the engine
//! only ever calls [`TaskRegistry::resolve`]. Once wrapped in an `Arc` the
//! registry is read-only and safe for concurrent lookups.

use std::collections::HashMap;
use std::sync::Arc;

use tasks::{
    BatchHandler, ControlHandler, HttpCalloutHandler, NotificationHandler, ScriptHandler,
    TaskHandler, TransformHandler,
};

use crate::models::TaskKind;
use crate::EngineError;

#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").field("kinds", &self.kinds()).finish()
    }
}

impl TaskRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in handlers for every kind except
    /// StoragePush, which needs a sink from the host.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let control: Arc<dyn TaskHandler> = Arc::new(ControlHandler);

        registry.register(TaskKind::HttpCallout, Arc::new(HttpCalloutHandler::new()));
        registry.register(TaskKind::ScriptExecution, Arc::new(ScriptHandler));
        registry.register(TaskKind::DataTransformation, Arc::new(TransformHandler));
        registry.register(TaskKind::Batch, Arc::new(BatchHandler));
        registry.register(TaskKind::Notification, Arc::new(NotificationHandler));
        for kind in [TaskKind::Conditional, TaskKind::Iteration, TaskKind::Parallel, TaskKind::Delay] {
            registry.register(kind, Arc::clone(&control));
        }
        registry
    }

    /// Associate `handler` with `kind`. Last registration wins; the previous
    /// handler, if any, is returned.
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.insert(kind, handler)
    }

    /// # Errors
    /// [`EngineError::UnknownTaskKind`] when nothing is registered for `kind`.
    pub fn resolve(&self, kind: TaskKind) -> Result<Arc<dyn TaskHandler>, EngineError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(EngineError::UnknownTaskKind(kind))
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL.into_iter().filter(|k| self.handlers.contains_key(k)).collect()
    }
}
