//! Web fetch tool: restricted to `http(s)`, with a hard cap on response
//! size enforced while streaming rather than after the fact.

use agentry_core::{AgentError, ToolSchema};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::registry::Tool;

pub struct WebFetchTool {
    client: reqwest::Client,
    pub max_bytes: usize,
    pub timeout: std::time::Duration,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("agentry-web-fetch/0.1")
            .build()
            .expect("reqwest client builds with static config");
        Self { client, max_bytes: 65_536, timeout: std::time::Duration::from_secs(10) }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "web_fetch",
            "Fetch an http(s) URL and return the response body as UTF-8 text, capped at a fixed size.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "The http or https URL to fetch." }
                },
                "required": ["url"]
            }),
            vec!["url".to_string()],
        )
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let raw_url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ToolValidation { tool: "web_fetch".into(), message: "url is required".into() })?;

        let url = url::Url::parse(raw_url)
            .map_err(|e| AgentError::ToolValidation { tool: "web_fetch".into(), message: format!("invalid url: {e}") })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(AgentError::ToolSecurity { tool: "web_fetch".into(), reason: format!("scheme '{}' not allowed", url.scheme()) });
        }

        let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| AgentError::ToolTimeout { tool: "web_fetch".into(), timeout_secs: self.timeout.as_secs() })?
            .map_err(|e| AgentError::ToolExecution { tool: "web_fetch".into(), message: e.to_string() })?;

        if !response.status().is_success() {
            return Err(AgentError::ToolExecution {
                tool: "web_fetch".into(),
                message: format!("upstream returned {}", response.status()),
            });
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        let mut truncated = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AgentError::ToolExecution { tool: "web_fetch".into(), message: e.to_string() })?;
            if bytes.len() + chunk.len() > self.max_bytes {
                let remaining = self.max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        if truncated {
            Ok(format!("{text}\n[... truncated at {} bytes]", self.max_bytes))
        } else {
            Ok(text)
        }
    }
}
