//! `HttpCalloutHandler`: performs an outbound HTTP request.
//!
//! Settings:
//! ```json
//! { "url": "https://api.example.com/items/{{ item_id }}",
//!   "method": "POST",
//!   "headers": { "authorization": "Bearer {{ token }}" },
//!   "body": { "name": "widget" },
//!   "output_variable": "item" }
//! ```
//!
//! Connection failures, timeouts, 429 and 5xx responses are recoverable;
//! any other 4xx is terminal.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::expression::render_template;
use crate::traits::parse_config;
use crate::{TaskContext, TaskError, TaskHandler, TaskOutput};

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
struct HttpCalloutSettings {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    output_variable: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpCalloutHandler {
    client: reqwest::Client,
}

impl HttpCalloutHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify(err: reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::Timeout
    } else if err.is_builder() {
        TaskError::InvalidConfig(err.to_string())
    } else {
        TaskError::Recoverable(err.to_string())
    }
}

#[async_trait]
impl TaskHandler for HttpCalloutHandler {
    async fn execute(&self, ctx: &TaskContext, config: &Value) -> Result<TaskOutput, TaskError> {
        let settings: HttpCalloutSettings = parse_config(config)?;

        let method = Method::from_bytes(settings.method.to_uppercase().as_bytes())
            .map_err(|_| TaskError::InvalidConfig(format!("unsupported method '{}'", settings.method)))?;
        let url = render_template(&settings.url, &ctx.variables);

        debug!(task_id = %ctx.task_id, %method, %url, "sending http callout");

        let mut request = self.client.request(method, &url).timeout(ctx.remaining());
        for (name, value) in &settings.headers {
            request = request.header(name.as_str(), render_template(value, &ctx.variables));
        }
        if let Some(body) = &settings.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let text = response.text().await.map_err(classify)?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TaskError::Recoverable(format!("{url} responded {status}")));
        }
        if status.is_client_error() {
            return Err(TaskError::Terminal(format!("{url} responded {status}")));
        }

        let mut output = TaskOutput::new(json!({ "status": status.as_u16(), "body": body.clone() }));
        if let Some(name) = settings.output_variable {
            output = output.with_variable(name, body);
        }
        Ok(output)
    }
}
