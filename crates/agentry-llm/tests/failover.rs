//! End-to-end exercise of primary/fallback dispatch and the cooldown gate
//! that follows three consecutive failures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentry_core::{AgentError, Message, ToolSchema, TokenUsage};
use agentry_llm::adapter::{AdapterCapabilities, ChatParams, LlmAdapter, StreamChunk};
use agentry_llm::client::{AdapterEntry, LlmClient, RetryPolicy};
use agentry_llm::health::{FailoverConfig, HealthMonitor};
use async_trait::async_trait;

struct AlwaysDown {
    calls: AtomicU32,
}

#[async_trait]
impl LlmAdapter for AlwaysDown {
    fn name(&self) -> &str {
        "primary"
    }
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities { supports_tools: true, supports_streaming: false, supports_system_role: true, max_context_tokens: 8192 }
    }
    async fn chat(&self, _messages: &[Message], _tools: &[ToolSchema], _params: &ChatParams) -> Result<(Message, TokenUsage), AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::LlmConnection("connection reset".into()))
    }
    async fn stream(&self, _messages: &[Message], _tools: &[ToolSchema], _params: &ChatParams) -> Result<futures::stream::BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
        unimplemented!()
    }
}

struct AlwaysUp;

#[async_trait]
impl LlmAdapter for AlwaysUp {
    fn name(&self) -> &str {
        "secondary"
    }
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities { supports_tools: true, supports_streaming: false, supports_system_role: true, max_context_tokens: 8192 }
    }
    async fn chat(&self, _messages: &[Message], _tools: &[ToolSchema], _params: &ChatParams) -> Result<(Message, TokenUsage), AgentError> {
        Ok((Message::assistant("from secondary", vec![], 1), TokenUsage::default()))
    }
    async fn stream(&self, _messages: &[Message], _tools: &[ToolSchema], _params: &ChatParams) -> Result<futures::stream::BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
        unimplemented!()
    }
}

fn no_retry_policy() -> RetryPolicy {
    // Exactly one attempt per call, so a "3 consecutive calls" scenario maps
    // onto 3 separate `chat()` invocations rather than retries within one.
    RetryPolicy { max_retries: 1, base_delay: Duration::from_millis(1), backoff_factor: 1.0, max_delay: Duration::from_millis(1), jitter_fraction: 0.0 }
}

#[tokio::test]
async fn primary_failure_run_fails_over_and_then_trips_into_cooldown() {
    let primary = Arc::new(AlwaysDown { calls: AtomicU32::new(0) });
    let health = Arc::new(HealthMonitor::new(FailoverConfig::default()));
    let client = LlmClient::new(
        vec![
            AdapterEntry { adapter: primary.clone(), priority: 0 },
            AdapterEntry { adapter: Arc::new(AlwaysUp), priority: 1 },
        ],
        health.clone(),
        no_retry_policy(),
    );
    let params = ChatParams::new("m");

    // Three consecutive turns: each call exhausts primary's one-shot budget,
    // records a failure, and falls over to the healthy secondary.
    for _ in 0..3 {
        let (message, _usage) = client.chat(&[], &[], &params).await.unwrap();
        assert_eq!(message.content, "from secondary");
    }

    assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    assert!(!health.is_available("primary"));

    // Next turn within the cooldown window: primary is skipped without an
    // attempt, so its call counter does not advance.
    let (message, _usage) = client.chat(&[], &[], &params).await.unwrap();
    assert_eq!(message.content, "from secondary");
    assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
}
