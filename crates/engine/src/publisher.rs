//! Status publisher boundary.
//!
//! The engine reports every run-level and task-level transition here. The
//! concrete transport (push channel, message bus, ...) lives outside the
//! engine; a publish failure is never allowed to fault a run.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::models::ExecutionStatus;

/// One status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub run_id: Uuid,
    /// `None` for run-level transitions.
    pub task_id: Option<String>,
    pub old: ExecutionStatus,
    pub new: ExecutionStatus,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, event: StatusEvent) -> Result<(), PublishError>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl StatusPublisher for NoopPublisher {
    async fn publish(&self, _event: StatusEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Writes each event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl StatusPublisher for TracingPublisher {
    async fn publish(&self, event: StatusEvent) -> Result<(), PublishError> {
        match &event.task_id {
            Some(task_id) => info!(run_id = %event.run_id, %task_id, from = %event.old, to = %event.new, "task status"),
            None => info!(run_id = %event.run_id, from = %event.old, to = %event.new, "run status"),
        }
        Ok(())
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusPublisher for ChannelPublisher {
    async fn publish(&self, event: StatusEvent) -> Result<(), PublishError> {
        self.tx.send(event).map_err(|_| PublishError::Closed)
    }
}

/// Publish with a time bound. Failures are logged and dropped.
pub(crate) async fn deliver(publisher: &dyn StatusPublisher, limit: Duration, event: StatusEvent) {
    let run_id = event.run_id;
    match tokio::time::timeout(limit, publisher.publish(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%run_id, "status publish failed: {e}"),
        Err(_) => debug!(%run_id, ?limit, "status publish timed out"),
    }
}
