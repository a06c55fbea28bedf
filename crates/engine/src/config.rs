//! Engine configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config:
//!
//! ```toml
//! default_task_timeout_ms = 30000
//! publish_timeout_ms = 250
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 100
//! multiplier = 2.0
//!
//! [retry_by_kind.http_callout]
//! max_attempts = 5
//! base_delay_ms = 500
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{TaskDefinition, TaskKind};
use crate::retry::RetryPolicy;
use crate::EngineError;

/// Tuning knobs for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry policy for tasks without a more specific one.
    pub retry: RetryPolicy,
    /// Per-kind retry policies, keyed by snake_case kind name.
    pub retry_by_kind: HashMap<String, RetryPolicy>,
    /// Deadline for a single handler attempt.
    pub default_task_timeout_ms: u64,
    /// Upper bound on a single status publish.
    pub publish_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retry_by_kind: HashMap::new(),
            default_task_timeout_ms: 30_000,
            publish_timeout_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(source).map_err(|e| EngineError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let source = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Set the retry policy for one task kind.
    pub fn with_kind_retry(mut self, kind: TaskKind, policy: RetryPolicy) -> Self {
        self.retry_by_kind.insert(kind.as_str().to_string(), policy);
        self
    }

    /// Task instance policy, then kind policy, then the default.
    pub fn retry_policy_for(&self, task: &TaskDefinition) -> RetryPolicy {
        task.retry
            .clone()
            .or_else(|| self.retry_by_kind.get(task.kind.as_str()).cloned())
            .unwrap_or_else(|| self.retry.clone())
    }

    pub fn task_timeout(&self, task: &TaskDefinition) -> Duration {
        Duration::from_millis(task.timeout_ms.unwrap_or(self.default_task_timeout_ms))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    fn check(&self) -> Result<(), EngineError> {
        for key in self.retry_by_kind.keys() {
            key.parse::<TaskKind>().map_err(EngineError::Config)?;
        }
        if self.default_task_timeout_ms == 0 {
            return Err(EngineError::Config("default_task_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
