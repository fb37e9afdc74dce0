//! The tool-use loop for one user message (spec §4.8).
//!
//! `AgentController` is a thin driver over the handles an `AgentRuntime`
//! already owns; it holds no state of its own beyond the `Arc` to that
//! runtime, so many turns (never concurrently on the same conversation,
//! per spec §5) can share one controller.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use agentry_context::{CompactionConfig, TokenEstimator as _};
use agentry_core::{AgentError, Message, Role, Timestamp, ToolCall, ToolResult, TokenUsage};
use agentry_llm::adapter::{ChatParams, StreamChunk, ToolCallAccumulator};
use agentry_prompt::{PromptBudget, PromptInputs};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::entity_tracking::infer_entity;
use crate::events::{StreamEvent, StreamSink};
use crate::retrospect::RetrospectContext;
use crate::runtime::AgentRuntime;
use crate::verifier::Verifier;

/// Spec §4.6's per-call retrieval contract default (`top_k=5`).
const DEFAULT_MEMORY_TOP_K: usize = 5;

/// Renders the environment section of the system prompt (spec §4.4: OS,
/// cwd, time, locale). Best-effort: a field that can't be read is simply
/// omitted rather than failing the turn.
fn render_environment() -> String {
    let mut lines = vec![format!("os: {}", std::env::consts::OS)];
    if let Ok(cwd) = std::env::current_dir() {
        lines.push(format!("cwd: {}", cwd.display()));
    }
    if let Ok(now) = time::OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339) {
        lines.push(format!("time: {now}"));
    }
    let locale = std::env::var("LANG").unwrap_or_else(|_| "C".to_string());
    lines.push(format!("locale: {locale}"));
    lines.join("\n")
}

/// Why the loop in `run_turn` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Done,
    IterationCap,
    Cancelled,
}

/// The synchronous `chat()` contract's return shape (spec §6).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub conversation_id: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

struct TurnOutcome {
    last_assistant: Option<Message>,
    all_tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
    reason: StopReason,
}

pub struct AgentController {
    runtime: Arc<AgentRuntime>,
}

impl AgentController {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    /// Synchronous form: runs the turn to completion and returns the final
    /// assistant message (spec §6 `chat`).
    pub async fn chat(
        &self,
        message: impl Into<String>,
        conversation_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, AgentError> {
        let conversation_id = conversation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let outcome = self.run_turn(&conversation_id, message.into(), &cancel, None).await?;

        if outcome.reason == StopReason::Cancelled {
            return Err(AgentError::Cancelled);
        }

        let message = outcome.last_assistant.unwrap_or_else(|| Message::assistant(String::new(), vec![], 0));
        Ok(ChatResponse {
            message,
            conversation_id,
            tool_calls: outcome.all_tool_calls,
            usage: outcome.usage,
        })
    }

    /// Streaming form (spec §6 `chat_stream`): forwards every event to
    /// `sink` and returns once a `Done`/`Error` has been emitted.
    pub async fn chat_stream(
        &self,
        message: impl Into<String>,
        conversation_id: Option<String>,
        cancel: CancellationToken,
        sink: Arc<dyn StreamSink>,
    ) -> Result<(), AgentError> {
        let conversation_id = conversation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        match self.run_turn(&conversation_id, message.into(), &cancel, Some(sink.as_ref())).await {
            Ok(outcome) => {
                if outcome.reason == StopReason::Cancelled {
                    sink.send(StreamEvent::error(&AgentError::Cancelled)).await;
                    return Err(AgentError::Cancelled);
                }
                let content = outcome.last_assistant.map(|m| m.content).unwrap_or_default();
                sink.send(StreamEvent::Done { content, usage: outcome.usage }).await;
                Ok(())
            }
            Err(e) => {
                sink.send(StreamEvent::error(&e)).await;
                Err(e)
            }
        }
    }

    /// The §4.8 loop, shared by both public entry points. `sink` is `None`
    /// for the synchronous `chat()` path.
    async fn run_turn(
        &self,
        conversation_id: &str,
        user_text: String,
        cancel: &CancellationToken,
        sink: Option<&dyn StreamSink>,
    ) -> Result<TurnOutcome, AgentError> {
        self.runtime.busy.store(true, Ordering::Relaxed);
        *self.runtime.current_task.lock() = Some(user_text.clone());
        self.runtime.totals.record_turn();

        let result = self.run_turn_inner(conversation_id, user_text, cancel, sink).await;

        self.runtime.busy.store(false, Ordering::Relaxed);
        *self.runtime.current_task.lock() = None;
        result
    }

    async fn run_turn_inner(
        &self,
        conversation_id: &str,
        user_text: String,
        cancel: &CancellationToken,
        sink: Option<&dyn StreamSink>,
    ) -> Result<TurnOutcome, AgentError> {
        let runtime = &self.runtime;
        let config = &runtime.config;

        let conversation = runtime.memory.load_conversation(conversation_id).await.unwrap_or_else(|e| {
            log::warn!("failed to load conversation {conversation_id}: {e}");
            agentry_core::Conversation::new(conversation_id)
        });
        let mut working_messages = conversation.messages;
        let title = if conversation.title.is_empty() { user_text.chars().take(60).collect() } else { conversation.title.clone() };

        working_messages.push(Message::user(user_text.clone(), 0));

        let mut task = runtime.task_monitor.start_task(user_text.clone(), config.llm_model.clone());
        let mut all_tool_calls: Vec<ToolCall> = Vec::new();
        let mut turn_tool_results: Vec<ToolResult> = Vec::new();
        let mut total_usage = TokenUsage::default();
        let mut last_assistant: Option<Message> = None;
        let mut iteration = 0usize;
        let started_at = Timestamp::now();

        let reason = loop {
            if iteration >= config.max_iterations {
                break StopReason::IterationCap;
            }
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let this_iteration = iteration;
            let tool_schemas = runtime.tools.schemas();
            let capabilities = runtime.llm_client.capabilities();

            let retrieved = match runtime.retriever.retrieve(&user_text, None, DEFAULT_MEMORY_TOP_K, None).await {
                Ok(scored) => scored,
                Err(e) => {
                    // MemoryRetrieval failures degrade gracefully (spec §7):
                    // proceed with an empty retrieved set.
                    log::warn!("memory retrieval failed, proceeding without it: {e}");
                    Vec::new()
                }
            };
            let memory_digest = retrieved.iter().map(|s| format!("- {}", s.entry.content)).collect::<Vec<_>>().join("\n");
            let recent_entities_text = runtime.recent_entities.lock().render();

            let inputs = PromptInputs {
                persona: runtime.persona.render(),
                environment: render_environment(),
                recent_entities: recent_entities_text,
                memory_digest,
                tool_catalog: tool_schemas.clone(),
                hidden_auxiliary: None,
            };
            let budget = PromptBudget { max_tokens: config.effective_target_prompt_tokens() };
            let system_prompt = runtime.assembler.assemble(&inputs, budget, &capabilities);

            let outcome = runtime.compactor.compact(&working_messages, runtime.llm_client.as_ref(), cancel).await?;
            let mut prompt_messages = vec![system_prompt.message.clone()];
            prompt_messages.extend(outcome.messages);

            let mut params = ChatParams::new(config.llm_model.clone());
            params.temperature = config.llm_temperature;
            params.max_tokens = config.llm_max_tokens;

            let mut iteration_record = agentry_core::IterationRecord::begin(this_iteration, config.llm_model.clone());

            let call_result = self.call_llm(&prompt_messages, &tool_schemas, &params, sink, cancel).await;
            let (assistant_message, usage) = match call_result {
                Ok(pair) => pair,
                Err(AgentError::LlmContextOverflow(first_reason)) => {
                    // spec §7: catch once, tighten compaction by 20%, retry
                    // the iteration once; a second overflow aborts the turn.
                    log::warn!("context overflow on iteration {this_iteration}, retrying with tighter compaction: {first_reason}");
                    let tighter_config = CompactionConfig {
                        target_tokens: (budget.max_tokens as f64 * 0.8) as u32,
                        ..Default::default()
                    };
                    let tighter_compactor = agentry_context::Compactor::new(Arc::new(agentry_context::HeuristicEstimator), tighter_config);
                    let retry_outcome = tighter_compactor.compact(&working_messages, runtime.llm_client.as_ref(), cancel).await?;
                    let mut retry_prompt = vec![system_prompt.message.clone()];
                    retry_prompt.extend(retry_outcome.messages);

                    match self.call_llm(&retry_prompt, &tool_schemas, &params, sink, cancel).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            runtime.task_monitor.finish_task(&mut task, false, Some(e.to_string()));
                            self.persist_best_effort(conversation_id, &working_messages, &title).await;
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    runtime.task_monitor.finish_task(&mut task, false, Some(e.to_string()));
                    self.persist_best_effort(conversation_id, &working_messages, &title).await;
                    return Err(e);
                }
            };

            let sanitized_content = crate::sanitize::sanitize(&assistant_message.content);
            let assistant_message = Message { content: sanitized_content, ..assistant_message };

            iteration_record.prompt_tokens = usage.input as u32;
            iteration_record.completion_tokens = usage.output as u32;
            iteration_record.tool_calls = assistant_message.tool_calls.iter().map(|c| c.name.clone()).collect();
            iteration_record.ended_at = Some(Timestamp::now());
            runtime.task_monitor.record_iteration(&mut task, iteration_record, usage);
            runtime.totals.record_usage(usage);
            total_usage += usage;

            all_tool_calls.extend(assistant_message.tool_calls.clone());
            working_messages.push(assistant_message.clone());
            last_assistant = Some(assistant_message.clone());
            iteration += 1;

            if assistant_message.tool_calls.is_empty() {
                let completed = Verifier::is_complete(&assistant_message, &user_text, &turn_tool_results, runtime.llm_client.as_ref()).await?;
                if completed || this_iteration == 0 {
                    break StopReason::Done;
                }
                continue;
            }

            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            runtime.totals.record_tool_calls(assistant_message.tool_calls.len() as u64);
            let results = runtime.executor.execute_all(&assistant_message.tool_calls, cancel).await;

            for (call, result) in assistant_message.tool_calls.iter().zip(results.iter()) {
                if let Some(entity) = infer_entity(call, result) {
                    runtime.recent_entities.lock().record(entity);
                }
            }

            for result in &results {
                let content = if result.success { result.output.clone() } else { result.error.clone().unwrap_or_default() };
                working_messages.push(Message::tool_result(result.tool_call_id.clone(), content, 0));
                if let Some(sink) = sink {
                    sink.send(StreamEvent::ToolResult(result.clone())).await;
                }
            }
            turn_tool_results.extend(results);
        };

        let success = reason == StopReason::Done;
        runtime.task_monitor.finish_task(&mut task, success, None);

        if let Err(e) = runtime.memory.save_conversation(conversation_id, &working_messages, &title).await {
            // MemoryStorage failures on final persist are logged and
            // surfaced as a non-fatal warning, not a turn failure (spec §7).
            log::warn!("failed to persist conversation {conversation_id}: {e}");
        }

        self.maybe_schedule_retrospect(&task, started_at, success);

        Ok(TurnOutcome {
            last_assistant,
            all_tool_calls,
            usage: total_usage,
            reason,
        })
    }

    async fn persist_best_effort(&self, conversation_id: &str, working_messages: &[Message], title: &str) {
        if let Err(e) = self.runtime.memory.save_conversation(conversation_id, working_messages, title).await {
            log::warn!("best-effort persist of conversation {conversation_id} failed: {e}");
        }
    }

    /// Dispatches to the streaming or synchronous adapter path depending on
    /// whether a `StreamSink` is attached (spec §4.8 "Streaming emission").
    #[tracing::instrument(skip_all)]
    async fn call_llm(
        &self,
        prompt_messages: &[Message],
        tool_schemas: &[agentry_core::ToolSchema],
        params: &ChatParams,
        sink: Option<&dyn StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<(Message, TokenUsage), AgentError> {
        match sink {
            None => self.runtime.llm_client.chat(prompt_messages, tool_schemas, params).await,
            Some(sink) => self.call_llm_streaming(prompt_messages, tool_schemas, params, sink, cancel).await,
        }
    }

    async fn call_llm_streaming(
        &self,
        prompt_messages: &[Message],
        tool_schemas: &[agentry_core::ToolSchema],
        params: &ChatParams,
        sink: &dyn StreamSink,
        cancel: &CancellationToken,
    ) -> Result<(Message, TokenUsage), AgentError> {
        let mut stream = self.runtime.llm_client.stream(prompt_messages, tool_schemas, params).await?;
        let mut content = String::new();
        let mut accumulator = ToolCallAccumulator::new();
        let mut usage = TokenUsage::default();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            match chunk? {
                StreamChunk::TextDelta(delta) => {
                    sink.send(StreamEvent::Text { delta: delta.clone() }).await;
                    content.push_str(&delta);
                }
                StreamChunk::ToolCallStart { id, name } => {
                    sink.send(StreamEvent::ToolStart { id: id.clone(), name: name.clone() }).await;
                    accumulator.start(&id, &name);
                }
                StreamChunk::ToolCallDelta { id, json_fragment } => {
                    accumulator.delta(&id, &json_fragment);
                }
                StreamChunk::ToolCallEnd { id } => {
                    sink.send(StreamEvent::ToolEnd { id: id.clone() }).await;
                }
                StreamChunk::UsageReport(reported) => usage = reported,
                StreamChunk::Done => break,
            }
        }

        let tool_calls = accumulator.finish();
        let estimate = agentry_context::HeuristicEstimator.estimate_text(&content);
        Ok((Message::assistant(content, tool_calls, estimate), usage))
    }

    /// Kicks off a background retrospect when the turn ran long or failed
    /// (spec §4.9). Best-effort: failures are logged, never surfaced.
    fn maybe_schedule_retrospect(&self, task: &agentry_core::TaskRecord, started_at: Timestamp, success: bool) {
        let runtime = Arc::clone(&self.runtime);
        if !runtime.config.retrospect_enabled {
            return;
        }
        let Some(generator) = runtime.retrospect.clone() else { return };

        let elapsed = (Timestamp::now().wall_clock - started_at.wall_clock).as_seconds_f64().max(0.0);
        if elapsed < runtime.config.retrospect_threshold_s as f64 && success {
            return;
        }

        let context = RetrospectContext::from_task(task, elapsed);
        let date = time::OffsetDateTime::now_utc().date().to_string();
        tokio::spawn(async move {
            if let Err(e) = generator.generate_and_persist(context, &date).await {
                log::warn!("retrospect generation failed: {e}");
            }
        });
    }
}
