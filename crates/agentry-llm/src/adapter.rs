//! The uniform provider interface every vendor backend implements (spec §4.1).

use agentry_core::{AgentError, Message, ToolCall, ToolSchema, TokenUsage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// How the model should use the tools it was given.
#[derive(Debug, Clone, Default)]
pub enum ToolChoice {
    /// Model must call at least one tool.
    Any,
    /// Model may call zero or more tools.
    #[default]
    Auto,
    /// Model must call exactly the named tool.
    Tool(String),
    /// Tools are not offered for this call even if configured.
    None,
}

/// Per-call generation parameters (spec §4.1).
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub tool_choice: ToolChoice,
}

impl ChatParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            stop: Vec::new(),
            tool_choice: ToolChoice::Auto,
        }
    }
}

/// What a provider adapter can do, used by the prompt assembler (spec §4.4)
/// to decide whether large system prompts need an auxiliary user-role block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_system_role: bool,
    pub max_context_tokens: u32,
}

/// A tagged streaming chunk, normalized from whatever the vendor actually
/// sends (spec §4.1, §9 open question on vendor payload shapes — adapters
/// are responsible for normalizing to exactly these variants).
#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    /// Partial JSON accumulating into one tool call's `arguments`.
    ToolCallDelta { id: String, json_fragment: String },
    ToolCallEnd { id: String },
    UsageReport(TokenUsage),
    Done,
}

/// One vendor's chat/stream surface behind a canonical interface.
///
/// Adapters never retry — they classify failures into `AgentError`'s LLM
/// variants and raise immediately; retry/failover is the client's job
/// (spec §4.1, §4.2).
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        params: &ChatParams,
    ) -> Result<(Message, TokenUsage), AgentError>;

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        params: &ChatParams,
    ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError>;
}

/// Accumulates `StreamChunk::ToolCallStart/Delta/End` into complete
/// `ToolCall`s, preserving declaration order. Adapters share this so the
/// JSON-accumulation logic isn't duplicated per vendor.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    order: Vec<String>,
    names: std::collections::HashMap<String, String>,
    json: std::collections::HashMap<String, String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, id: &str, name: &str) {
        if !self.names.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.names.insert(id.to_string(), name.to_string());
        self.json.entry(id.to_string()).or_default();
    }

    pub fn delta(&mut self, id: &str, fragment: &str) {
        self.json.entry(id.to_string()).or_default().push_str(fragment);
    }

    /// Finalize into `ToolCall`s in the order they were first seen.
    /// Malformed JSON arguments fall back to an empty object rather than
    /// failing the whole response — the tool executor's validation step
    /// (spec §4.7) will reject the call instead.
    pub fn finish(self) -> Vec<ToolCall> {
        self.order
            .into_iter()
            .map(|id| {
                let name = self.names.get(&id).cloned().unwrap_or_default();
                let raw = self.json.get(&id).cloned().unwrap_or_default();
                let arguments = serde_json::from_str(&raw).unwrap_or(serde_json::json!({}));
                ToolCall { id, name, arguments }
            })
            .collect()
    }
}
