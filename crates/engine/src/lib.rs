//! `engine` crate: definition model, graph validation and the workflow
//! execution engine.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod models;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod signal;
pub mod store;

mod executor;

pub use config::EngineConfig;
pub use context::{RunSnapshot, TaskRecord};
pub use engine::WorkflowEngine;
pub use error::{ControlError, EngineError, PublishError, StoreError, ValidationError, Violation};
pub use graph::{validate, Flow, ResolvedGraph, ResolvedTask};
pub use models::{
    ExecutionStatus, FailurePolicy, TaskDefinition, TaskKind, TriggerContext, TriggerDefinition,
    TriggerKind, VariableDefinition, VariableType, WorkflowDefinition,
};
pub use publisher::{ChannelPublisher, NoopPublisher, StatusEvent, StatusPublisher, TracingPublisher};
pub use registry::TaskRegistry;
pub use retry::RetryPolicy;
pub use store::{DefinitionStore, InMemoryDefinitionStore};

#[cfg(test)]
mod engine_tests;
