//! Anthropic Messages API adapter: content-block request/response shape,
//! `tool_use`/`tool_result` blocks, and SSE streaming over
//! `content_block_start`/`content_block_delta`/`content_block_stop`.

use std::time::Duration;

use agentry_core::{AgentError, Message, Role, ToolCall, ToolSchema, TokenUsage};
use agentry_llm::adapter::{AdapterCapabilities, ChatParams, LlmAdapter, StreamChunk, ToolCallAccumulator, ToolChoice};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_version: "2023-06-01".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct AnthropicAdapter {
    config: AnthropicConfig,
    http: reqwest::Client,
    max_context_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self {
            config,
            http,
            max_context_tokens: 200_000,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Anthropic pulls leading `system` messages out of the turn list into
    /// a top-level `system` field; everything else becomes `user`/`assistant`
    /// content blocks, with tool calls and tool results as their own block
    /// types rather than dedicated message roles.
    fn split_system_and_turns(&self, messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system_parts = Vec::new();
        let mut turns = Vec::new();

        for message in messages {
            match message.role {
                Role::System => system_parts.push(message.content.clone()),
                Role::User => turns.push(json!({
                    "role": "user",
                    "content": [{ "type": "text", "text": message.content }],
                })),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(json!({ "type": "text", "text": message.content }));
                    }
                    for call in &message.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    turns.push(json!({ "role": "assistant", "content": blocks }));
                }
                Role::Tool => {
                    let tool_use_id = message.tool_call_id.clone().unwrap_or_default();
                    turns.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": message.content,
                        }],
                    }));
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, turns)
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSchema], params: &ChatParams, stream: bool) -> Value {
        let (system, turns) = self.split_system_and_turns(messages);
        let mut body = json!({
            "model": params.model,
            "messages": turns,
            "max_tokens": params.max_tokens.unwrap_or(4096),
            "temperature": params.temperature,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !params.stop.is_empty() {
            body["stop_sequences"] = json!(params.stop);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools
                .iter()
                .map(|schema| json!({
                    "name": schema.name,
                    "description": schema.description,
                    "input_schema": schema.parameters,
                }))
                .collect::<Vec<_>>());
            body["tool_choice"] = tool_choice_json(&params.tool_choice);
        }
        body
    }
}

fn tool_choice_json(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Any => json!({ "type": "any" }),
        ToolChoice::Auto => json!({ "type": "auto" }),
        ToolChoice::None => json!({ "type": "auto" }),
        ToolChoice::Tool(name) => json!({ "type": "tool", "name": name }),
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

async fn classify_http_error(status: reqwest::StatusCode, body: String) -> AgentError {
    let parsed = serde_json::from_str::<AnthropicErrorEnvelope>(&body).ok();
    let (error_type, message) = match parsed {
        Some(envelope) => (envelope.error.error_type, envelope.error.message),
        None => (String::new(), body),
    };

    match status.as_u16() {
        401 | 403 => AgentError::LlmInvalidRequest(format!("authentication failed: {message}")),
        400 if error_type == "invalid_request_error" && message.to_lowercase().contains("context") => {
            AgentError::LlmContextOverflow(message)
        }
        400 | 404 | 422 => AgentError::LlmInvalidRequest(message),
        429 => AgentError::LlmRateLimit {
            message,
            retry_after_secs: None,
        },
        500..=599 => AgentError::LlmUpstream5xx {
            status: status.as_u16(),
            message,
        },
        _ => AgentError::LlmResponseMalformed(message),
    }
}

fn to_agent_message(response: AnthropicResponse) -> Result<(Message, TokenUsage), AgentError> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block.block_type.as_str() {
            "text" => text.push_str(&block.text.unwrap_or_default()),
            "tool_use" => {
                tool_calls.push(ToolCall {
                    id: block.id.ok_or_else(|| AgentError::LlmResponseMalformed("tool_use block missing id".into()))?,
                    name: block
                        .name
                        .ok_or_else(|| AgentError::LlmResponseMalformed("tool_use block missing name".into()))?,
                    arguments: block.input.unwrap_or(Value::Object(Default::default())),
                });
            }
            _ => {}
        }
    }

    let usage = response
        .usage
        .map(|u| TokenUsage {
            input: u.input_tokens as u64,
            output: u.output_tokens as u64,
            cache_read: 0,
            cache_creation: 0,
            estimated_cost: 0.0,
        })
        .unwrap_or_default();

    Ok((Message::assistant(text, tool_calls, 0), usage))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicStreamEvent {
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: usize,
        content_block: AnthropicStreamBlockStart,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: AnthropicStreamDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamBlockStart {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicStreamDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[async_trait]
impl LlmAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_system_role: true,
            max_context_tokens: self.max_context_tokens,
        }
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        params: &ChatParams,
    ) -> Result<(Message, TokenUsage), AgentError> {
        let body = self.request_body(messages, tools, params, false);
        let response = self
            .http
            .post(self.endpoint("messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::LlmConnection(e.to_string()))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| AgentError::LlmConnection(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_http_error(status, raw).await);
        }

        let parsed: AnthropicResponse = serde_json::from_str(&raw)
            .map_err(|e| AgentError::LlmResponseMalformed(format!("{e}: {raw}")))?;
        to_agent_message(parsed)
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        params: &ChatParams,
    ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
        let body = self.request_body(messages, tools, params, true);
        let response = self
            .http
            .post(self.endpoint("messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::LlmConnection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response
                .text()
                .await
                .map_err(|e| AgentError::LlmConnection(e.to_string()))?;
            return Err(classify_http_error(status, raw).await);
        }

        let mut byte_stream = response.bytes_stream().eventsource();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<StreamChunk, AgentError>>();

        tokio::spawn(async move {
            let mut accumulator = ToolCallAccumulator::new();
            let mut index_to_id: std::collections::HashMap<usize, String> = std::collections::HashMap::new();

            while let Some(event) = byte_stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        let _ = tx.send(Err(AgentError::LlmConnection(e.to_string())));
                        return;
                    }
                };
                if event.data.is_empty() {
                    continue;
                }
                let parsed: AnthropicStreamEvent = match serde_json::from_str(&event.data) {
                    Ok(e) => e,
                    Err(e) => {
                        let _ = tx.send(Err(AgentError::LlmResponseMalformed(e.to_string())));
                        return;
                    }
                };

                match parsed {
                    AnthropicStreamEvent::ContentBlockStart { index, content_block } => {
                        if content_block.block_type == "tool_use" {
                            let id = content_block.id.unwrap_or_default();
                            let name = content_block.name.unwrap_or_default();
                            index_to_id.insert(index, id.clone());
                            accumulator.start(&id, &name);
                            let _ = tx.send(Ok(StreamChunk::ToolCallStart { id, name }));
                        }
                    }
                    AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                        AnthropicStreamDelta::TextDelta { text } => {
                            let _ = tx.send(Ok(StreamChunk::TextDelta(text)));
                        }
                        AnthropicStreamDelta::InputJsonDelta { partial_json } => {
                            if let Some(id) = index_to_id.get(&index) {
                                accumulator.delta(id, &partial_json);
                                let _ = tx.send(Ok(StreamChunk::ToolCallDelta {
                                    id: id.clone(),
                                    json_fragment: partial_json,
                                }));
                            }
                        }
                        AnthropicStreamDelta::Other => {}
                    },
                    AnthropicStreamEvent::ContentBlockStop { index } => {
                        if let Some(id) = index_to_id.remove(&index) {
                            let _ = tx.send(Ok(StreamChunk::ToolCallEnd { id }));
                        }
                    }
                    AnthropicStreamEvent::MessageDelta { usage } => {
                        if let Some(usage) = usage {
                            let _ = tx.send(Ok(StreamChunk::UsageReport(TokenUsage {
                                input: usage.input_tokens as u64,
                                output: usage.output_tokens as u64,
                                cache_read: 0,
                                cache_creation: 0,
                                estimated_cost: 0.0,
                            })));
                        }
                    }
                    AnthropicStreamEvent::MessageStop => {
                        let _ = tx.send(Ok(StreamChunk::Done));
                        return;
                    }
                    AnthropicStreamEvent::Other => {}
                }
            }
            let _ = tx.send(Ok(StreamChunk::Done));
        });

        let output_stream = futures::stream::unfold(rx, |mut rx| async { rx.recv().await.map(|item| (item, rx)) });
        Ok(Box::pin(output_stream))
    }
}
