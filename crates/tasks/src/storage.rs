//! `StoragePushHandler`: appends a record to an external storage sink.
//!
//! Settings:
//! ```json
//! { "collection": "orders", "fields": ["order_id", "total"], "record": { "source": "web" } }
//! ```
//! The pushed record is `record` (if any) extended with the named variables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::traits::parse_config;
use crate::{TaskContext, TaskError, TaskHandler, TaskOutput};

/// Errors a sink may report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink could not be reached; worth retrying.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The sink refused the record.
    #[error("storage rejected record: {0}")]
    Rejected(String),
}

impl From<SinkError> for TaskError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Unavailable(_) => TaskError::Recoverable(err.to_string()),
            SinkError::Rejected(_) => TaskError::Terminal(err.to_string()),
        }
    }
}

/// Destination for StoragePush records.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn push(&self, collection: &str, record: Value) -> Result<(), SinkError>;
}

/// Sink that keeps records in memory, grouped by collection.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    records: Arc<Mutex<HashMap<String, Vec<Value>>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self, collection: &str) -> Vec<Value> {
        self.records.lock().await.get(collection).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl StorageSink for InMemorySink {
    async fn push(&self, collection: &str, record: Value) -> Result<(), SinkError> {
        self.records
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(record);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StoragePushSettings {
    collection: String,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    record: Option<Map<String, Value>>,
}

pub struct StoragePushHandler<S> {
    sink: S,
}

impl<S: StorageSink> StoragePushHandler<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S: StorageSink> TaskHandler for StoragePushHandler<S> {
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError> {
        let settings: StoragePushSettings = parse_config(config)?;

        let mut record = settings.record.unwrap_or_default();
        for field in &settings.fields {
            let value = ctx
                .variable(field)
                .ok_or_else(|| TaskError::Terminal(format!("variable '{field}' is not bound")))?;
            record.insert(field.clone(), value.clone());
        }
        let record = Value::Object(record);

        self.sink.push(&settings.collection, record.clone()).await?;

        Ok(TaskOutput::new(json!({ "collection": settings.collection, "record": record })))
    }
}
