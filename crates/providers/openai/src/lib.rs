//! OpenAI `/v1/chat/completions` adapter: translates the canonical message
//! and tool-schema types to OpenAI's wire format and back, non-streaming
//! and SSE-streaming alike.

use std::time::Duration;

use agentry_core::{AgentError, Message, Role, ToolCall, ToolSchema, TokenUsage};
use agentry_llm::adapter::{AdapterCapabilities, ChatParams, LlmAdapter, StreamChunk, ToolCallAccumulator, ToolChoice};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Configuration for one OpenAI(-compatible) endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct OpenAiAdapter {
    config: OpenAiConfig,
    http: reqwest::Client,
    max_context_tokens: u32,
}

impl OpenAiAdapter {
    pub fn new(config: OpenAiConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self {
            config,
            http,
            max_context_tokens: 128_000,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request_body(&self, messages: &[Message], tools: &[ToolSchema], params: &ChatParams, stream: bool) -> Value {
        let mut body = json!({
            "model": params.model,
            "messages": messages.iter().map(to_openai_message).collect::<Vec<_>>(),
            "temperature": params.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !params.stop.is_empty() {
            body["stop"] = json!(params.stop);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools.iter().map(to_openai_tool).collect::<Vec<_>>());
            body["tool_choice"] = tool_choice_json(&params.tool_choice);
        }
        body
    }
}

fn tool_choice_json(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Any => json!("required"),
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Tool(name) => json!({ "type": "function", "function": { "name": name } }),
    }
}

fn to_openai_tool(schema: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": schema.parameters,
        }
    })
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_openai_message(message: &Message) -> Value {
    let mut value = json!({
        "role": role_str(message.role),
        "content": message.content,
    });
    if let Some(tool_call_id) = &message.tool_call_id {
        value["tool_call_id"] = json!(tool_call_id);
    }
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = json!(message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": serde_json::to_string(&call.arguments).unwrap_or_default(),
                    }
                })
            })
            .collect::<Vec<_>>());
        value["content"] = Value::Null;
    }
    value
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiErrorBody,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    message: String,
    #[serde(default)]
    #[serde(rename = "type")]
    error_type: Option<String>,
}

async fn classify_http_error(status: reqwest::StatusCode, body: String) -> AgentError {
    let message = serde_json::from_str::<OpenAiErrorEnvelope>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);

    match status.as_u16() {
        401 | 403 => AgentError::LlmInvalidRequest(format!("authentication failed: {message}")),
        400 | 404 | 422 => {
            if message.to_lowercase().contains("context") || message.to_lowercase().contains("maximum context length") {
                AgentError::LlmContextOverflow(message)
            } else {
                AgentError::LlmInvalidRequest(message)
            }
        }
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

fn to_agent_message(response: OpenAiChatResponse) -> Result<(Message, TokenUsage), AgentError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::LlmResponseMalformed("no choices in response".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| -> Result<ToolCall, AgentError> {
            let arguments: Value = serde_json::from_str(&call.function.arguments)
                .map_err(|e| AgentError::LlmResponseMalformed(format!("bad tool arguments json: {e}")))?;
            Ok(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let content = choice.message.content.unwrap_or_default();
    let usage = response
        .usage
        .map(|u| TokenUsage {
            input: u.prompt_tokens as u64,
            output: u.completion_tokens as u64,
            cache_read: 0,
            cache_creation: 0,
            estimated_cost: 0.0,
        })
        .unwrap_or_default();

    Ok((Message::assistant(content, tool_calls, 0), usage))
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiStreamToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[async_trait]
impl LlmAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
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
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
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

        let parsed: OpenAiChatResponse = serde_json::from_str(&raw)
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
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
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
                if event.data == "[DONE]" {
                    for id in index_to_id.values() {
                        let _ = tx.send(Ok(StreamChunk::ToolCallEnd { id: id.clone() }));
                    }
                    let _ = tx.send(Ok(StreamChunk::Done));
                    return;
                }
                let chunk: OpenAiStreamChunk = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(AgentError::LlmResponseMalformed(e.to_string())));
                        return;
                    }
                };
                if let Some(usage) = chunk.usage {
                    let _ = tx.send(Ok(StreamChunk::UsageReport(TokenUsage {
                        input: usage.prompt_tokens as u64,
                        output: usage.completion_tokens as u64,
                        cache_read: 0,
                        cache_creation: 0,
                        estimated_cost: 0.0,
                    })));
                }
                for choice in chunk.choices {
                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() {
                            let _ = tx.send(Ok(StreamChunk::TextDelta(text)));
                        }
                    }
                    for tool_delta in choice.delta.tool_calls {
                        let id = if let Some(id) = tool_delta.id {
                            index_to_id.insert(tool_delta.index, id.clone());
                            if let Some(name) = tool_delta.function.as_ref().and_then(|f| f.name.clone()) {
                                accumulator.start(&id, &name);
                                let _ = tx.send(Ok(StreamChunk::ToolCallStart { id: id.clone(), name }));
                            }
                            id
                        } else {
                            match index_to_id.get(&tool_delta.index) {
                                Some(id) => id.clone(),
                                None => continue,
                            }
                        };
                        if let Some(args) = tool_delta.function.and_then(|f| f.arguments) {
                            accumulator.delta(&id, &args);
                            let _ = tx.send(Ok(StreamChunk::ToolCallDelta { id, json_fragment: args }));
                        }
                    }
                    if choice.finish_reason.is_some() {
                        for id in index_to_id.values() {
                            let _ = tx.send(Ok(StreamChunk::ToolCallEnd { id: id.clone() }));
                        }
                    }
                }
            }
            let _ = tx.send(Ok(StreamChunk::Done));
        });

        let output_stream = futures::stream::unfold(rx, |mut rx| async { rx.recv().await.map(|item| (item, rx)) });
        Ok(Box::pin(output_stream))
    }
}
