//! `NotificationHandler`: renders a message and hands it to the log.
//!
//! Delivery to real channels belongs to the surrounding system, which can
//! register its own handler for the Notification kind.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::expression::render_template;
use crate::traits::parse_config;
use crate::{TaskContext, TaskError, TaskHandler, TaskOutput};

fn default_channel() -> String {
    "log".to_string()
}

#[derive(Debug, Deserialize)]
struct NotificationSettings {
    #[serde(default = "default_channel")]
    channel: String,
    message: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationHandler;

#[async_trait]
impl TaskHandler for NotificationHandler {
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError> {
        let settings: NotificationSettings = parse_config(config)?;
        let message = render_template(&settings.message, &ctx.variables);

        info!(run_id = %ctx.run_id, task_id = %ctx.task_id, channel = %settings.channel, "{message}");

        Ok(TaskOutput::new(json!({ "channel": settings.channel, "message": message })))
    }
}
