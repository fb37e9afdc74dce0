//! The streaming event vocabulary forwarded to a `chat_stream` caller
//! (spec §4.8 "Streaming emission", §6 `chat_stream` event types).

use agentry_core::{AgentError, ToolResult, TokenUsage};
use serde::{Deserialize, Serialize};

/// One event on the `chat_stream` channel. `Done` is always last unless
/// `Error` preceded termination (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text { delta: String },
    ToolStart { id: String, name: String },
    ToolEnd { id: String },
    ToolResult(ToolResult),
    Error { kind: String, message: String, retriable: bool },
    Done { content: String, usage: TokenUsage },
}

impl StreamEvent {
    pub fn error(err: &AgentError) -> Self {
        StreamEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retriable: err.retriable(),
        }
    }
}

/// A sink the agent controller pushes `StreamEvent`s into. Implemented by
/// `tokio::sync::mpsc::Sender<StreamEvent>` so a transport layer (out of
/// scope here, spec §1) can drain it independently of the turn's
/// lifetime.
#[async_trait::async_trait]
pub trait StreamSink: Send + Sync {
    async fn send(&self, event: StreamEvent);
}

#[async_trait::async_trait]
impl StreamSink for tokio::sync::mpsc::Sender<StreamEvent> {
    async fn send(&self, event: StreamEvent) {
        let _ = tokio::sync::mpsc::Sender::send(self, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_event_carries_kind_message_and_retriable_from_agent_error() {
        let err = AgentError::LlmConnection("boom".into());
        let event = StreamEvent::error(&err);
        match event {
            StreamEvent::Error { kind, retriable, .. } => {
                assert_eq!(kind, "llm_connection");
                assert!(retriable);
            }
            _ => panic!("expected Error variant"),
        }
    }
}
