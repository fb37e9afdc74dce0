//! Primary+fallback orchestration, retry, and health-state tracking (spec §4.2).

use std::sync::Arc;
use std::time::Duration;

use agentry_core::{AgentError, Message, ToolSchema, TokenUsage};
use futures::StreamExt;
use rand::Rng;

use crate::adapter::{AdapterCapabilities, ChatParams, LlmAdapter, StreamChunk};
use crate::health::HealthMonitor;

/// Retry tuning for a single adapter attempt (spec §4.2 defaults).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs_f64(1.0),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with ±jitter_fraction jitter, capped at `max_delay`.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = capped * self.jitter_fraction;
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((capped + offset).max(0.0))
    }

    /// Only RateLimit, Connection and Upstream5xx are retried (spec §4.2 step 2).
    fn is_retriable(error: &AgentError) -> bool {
        matches!(
            error,
            AgentError::LlmRateLimit { .. } | AgentError::LlmConnection(_) | AgentError::LlmUpstream5xx { .. }
        )
    }
}

/// One entry in the client's ordered adapter list.
pub struct AdapterEntry {
    pub adapter: Arc<dyn LlmAdapter>,
    pub priority: u32,
}

/// Routes `chat`/`stream` calls across an ordered list of adapters,
/// consulting the `HealthMonitor` before each attempt and applying the
/// retry policy within a single adapter before falling through to the
/// next (spec §4.2).
pub struct LlmClient {
    adapters: Vec<AdapterEntry>,
    health: Arc<HealthMonitor>,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(mut adapters: Vec<AdapterEntry>, health: Arc<HealthMonitor>, retry: RetryPolicy) -> Self {
        adapters.sort_by_key(|e| e.priority);
        Self {
            adapters,
            health,
            retry,
        }
    }

    fn available_adapters(&self) -> impl Iterator<Item = &AdapterEntry> {
        self.adapters
            .iter()
            .filter(move |entry| self.health.is_available(entry.adapter.name()))
    }

    /// Capabilities of the adapter that would currently be dispatched to
    /// (the highest-priority available one), used by the prompt assembler
    /// to decide whether a hidden auxiliary block is needed (spec §4.4).
    /// Falls back to the first configured adapter's capabilities if none
    /// are currently available, since the assembler still needs a shape
    /// to plan against even mid-outage.
    pub fn capabilities(&self) -> AdapterCapabilities {
        self.available_adapters()
            .next()
            .or_else(|| self.adapters.first())
            .map(|entry| entry.adapter.capabilities())
            .unwrap_or(AdapterCapabilities {
                supports_tools: true,
                supports_streaming: true,
                supports_system_role: true,
                max_context_tokens: 100_000,
            })
    }

    /// Name of the adapter that would currently be dispatched to, for
    /// status reporting (spec §6 `status()`/`health()`).
    pub fn active_provider_name(&self) -> Option<&str> {
        self.available_adapters().next().or_else(|| self.adapters.first()).map(|entry| entry.adapter.name())
    }

    /// Synchronous (whole-response) chat with primary+fallback and retry
    /// (spec §4.2).
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        params: &ChatParams,
    ) -> Result<(Message, TokenUsage), AgentError> {
        let mut last_errors = Vec::new();

        for entry in self.available_adapters() {
            match self.chat_with_retry(entry, messages, tools, params).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_errors.push(format!("{}: {}", entry.adapter.name(), e));
                }
            }
        }

        Err(AgentError::LlmAllProvidersFailed(last_errors.join("; ")))
    }

    async fn chat_with_retry(
        &self,
        entry: &AdapterEntry,
        messages: &[Message],
        tools: &[ToolSchema],
        params: &ChatParams,
    ) -> Result<(Message, TokenUsage), AgentError> {
        let mut attempt = 0;
        loop {
            let started = std::time::Instant::now();
            match entry.adapter.chat(messages, tools, params).await {
                Ok((message, usage)) => {
                    self.health
                        .record_success(entry.adapter.name(), started.elapsed().as_millis() as u64);
                    return Ok((message, usage));
                }
                Err(e) => {
                    if !RetryPolicy::is_retriable(&e) {
                        self.health.record_failure(entry.adapter.name(), e.to_string());
                        return Err(e);
                    }
                    if attempt + 1 >= self.retry.max_retries {
                        self.health.record_failure(entry.adapter.name(), e.to_string());
                        return Err(e);
                    }
                    let delay = retry_delay(&self.retry, attempt, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Streaming chat. Failover is only permitted before the first chunk
    /// reaches the caller (spec §4.2); once `stream()` starts yielding, a
    /// failure is wrapped into a terminal `StreamChunk`-shaped error by the
    /// caller (the agent controller emits it as a single `error` event).
    pub async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        params: &ChatParams,
    ) -> Result<futures::stream::BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
        let mut last_errors = Vec::new();

        for entry in self.available_adapters() {
            match self.try_start_stream(entry, messages, tools, params).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_errors.push(format!("{}: {}", entry.adapter.name(), e)),
            }
        }

        Err(AgentError::LlmAllProvidersFailed(last_errors.join("; ")))
    }

    /// Establishes a stream and peeks its first item before handing it back,
    /// so that a connection failure on stream *creation* (or an immediate
    /// first-chunk error) can still fail over to the next adapter. Once a
    /// real chunk has been observed here, it is stitched back onto the
    /// front of the stream for the caller.
    async fn try_start_stream(
        &self,
        entry: &AdapterEntry,
        messages: &[Message],
        tools: &[ToolSchema],
        params: &ChatParams,
    ) -> Result<futures::stream::BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
        let mut attempt = 0;
        loop {
            match entry.adapter.stream(messages, tools, params).await {
                Ok(mut stream) => match stream.next().await {
                    Some(Ok(first)) => {
                        self.health.record_success(entry.adapter.name(), 0);
                        let rest: futures::stream::BoxStream<'static, Result<StreamChunk, AgentError>> =
                            Box::pin(futures::stream::once(async move { Ok(first) }).chain(stream));
                        return Ok(rest);
                    }
                    Some(Err(e)) => {
                        if !RetryPolicy::is_retriable(&e) || attempt + 1 >= self.retry.max_retries {
                            self.health.record_failure(entry.adapter.name(), e.to_string());
                            return Err(e);
                        }
                        let delay = retry_delay(&self.retry, attempt, &e);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        self.health.record_success(entry.adapter.name(), 0);
                        return Ok(Box::pin(futures::stream::empty()));
                    }
                },
                Err(e) => {
                    if !RetryPolicy::is_retriable(&e) || attempt + 1 >= self.retry.max_retries {
                        self.health.record_failure(entry.adapter.name(), e.to_string());
                        return Err(e);
                    }
                    let delay = retry_delay(&self.retry, attempt, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn retry_delay(policy: &RetryPolicy, attempt: u32, error: &AgentError) -> Duration {
    if let AgentError::LlmRateLimit {
        retry_after_secs: Some(secs),
        ..
    } = error
    {
        return Duration::from_secs(*secs);
    }
    policy.delay_for_attempt(attempt)
}

/// A narrow collaborator interface for components (the context compactor,
/// the completion verifier) that only need to issue a single bounded chat
/// call, not the full client surface (spec §9 "pass the Client as an
/// explicit collaborator... through a narrow interface").
#[async_trait::async_trait]
pub trait ChatBrain: Send + Sync {
    async fn quick_chat(&self, messages: &[Message], max_tokens: u32) -> Result<Message, AgentError>;
}

#[async_trait::async_trait]
impl ChatBrain for LlmClient {
    async fn quick_chat(&self, messages: &[Message], max_tokens: u32) -> Result<Message, AgentError> {
        let mut params = ChatParams::new("default");
        params.max_tokens = Some(max_tokens);
        let (message, _usage) = self.chat(messages, &[], &params).await?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterCapabilities;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyThenOk {
        fail_count: AtomicU32,
        fails_before_success: u32,
    }

    #[async_trait]
    impl LlmAdapter for FlakyThenOk {
        fn name(&self) -> &str {
            "flaky"
        }

        fn capabilities(&self) -> AdapterCapabilities {
            AdapterCapabilities {
                supports_tools: false,
                supports_streaming: false,
                supports_system_role: true,
                max_context_tokens: 8192,
            }
        }

        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            _params: &ChatParams,
        ) -> Result<(Message, TokenUsage), AgentError> {
            let n = self.fail_count.fetch_add(1, Ordering::SeqCst);
            if n < self.fails_before_success {
                Err(AgentError::LlmConnection("flaky".into()))
            } else {
                Ok((Message::assistant("ok", vec![], 1), TokenUsage::default()))
            }
        }

        async fn stream(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            _params: &ChatParams,
        ) -> Result<futures::stream::BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
            unimplemented!()
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(5),
            jitter_fraction: 0.0,
        }
    }

    #[tokio::test]
    async fn retries_connection_errors_then_succeeds() {
        let adapter = Arc::new(FlakyThenOk {
            fail_count: AtomicU32::new(0),
            fails_before_success: 2,
        });
        let client = LlmClient::new(
            vec![AdapterEntry {
                adapter: adapter.clone(),
                priority: 0,
            }],
            Arc::new(HealthMonitor::new(Default::default())),
            fast_policy(),
        );
        let params = ChatParams::new("m");
        let (msg, _) = client.chat(&[], &[], &params).await.unwrap();
        assert_eq!(msg.content, "ok");
    }

    #[tokio::test]
    async fn exhausting_retries_on_sole_adapter_surfaces_all_providers_failed() {
        let adapter = Arc::new(FlakyThenOk {
            fail_count: AtomicU32::new(0),
            fails_before_success: 100,
        });
        let client = LlmClient::new(
            vec![AdapterEntry {
                adapter,
                priority: 0,
            }],
            Arc::new(HealthMonitor::new(Default::default())),
            fast_policy(),
        );
        let params = ChatParams::new("m");
        let err = client.chat(&[], &[], &params).await.unwrap_err();
        assert!(matches!(err, AgentError::LlmAllProvidersFailed(_)));
    }

    #[tokio::test]
    async fn context_overflow_is_never_retried() {
        struct AlwaysOverflow;
        #[async_trait]
        impl LlmAdapter for AlwaysOverflow {
            fn name(&self) -> &str {
                "overflow"
            }
            fn capabilities(&self) -> AdapterCapabilities {
                AdapterCapabilities {
                    supports_tools: false,
                    supports_streaming: false,
                    supports_system_role: true,
                    max_context_tokens: 8192,
                }
            }
            async fn chat(
                &self,
                _messages: &[Message],
                _tools: &[ToolSchema],
                _params: &ChatParams,
            ) -> Result<(Message, TokenUsage), AgentError> {
                Err(AgentError::LlmContextOverflow("too big".into()))
            }
            async fn stream(
                &self,
                _messages: &[Message],
                _tools: &[ToolSchema],
                _params: &ChatParams,
            ) -> Result<futures::stream::BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
                unimplemented!()
            }
        }

        let client = LlmClient::new(
            vec![AdapterEntry {
                adapter: Arc::new(AlwaysOverflow),
                priority: 0,
            }],
            Arc::new(HealthMonitor::new(Default::default())),
            fast_policy(),
        );
        let params = ChatParams::new("m");
        let err = client.chat(&[], &[], &params).await.unwrap_err();
        // Only one attempt was made (no retry), surfaced via AllProvidersFailed
        // since it's the only adapter in the list.
        assert!(matches!(err, AgentError::LlmAllProvidersFailed(_)));
    }
}
