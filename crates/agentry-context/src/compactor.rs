//! Context-window compaction: groups messages into turns, summarizes the
//! oldest turns through an LLM when the window is over budget, and falls
//! back to hard truncation once summarization stops making room.
//!
//! A turn always starts at a user message and runs up to (but not
//! including) the next user message, so an assistant's tool calls and the
//! tool-result messages answering them are never split across a
//! compaction boundary.

use std::sync::Arc;

use agentry_core::{AgentError, Message, Role};
use agentry_llm::client::ChatBrain;
use tokio_util::sync::CancellationToken;

use crate::estimator::{TokenEstimator, MESSAGE_OVERHEAD_TOKENS};

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Stop compacting once total estimated tokens fall at or below this.
    pub target_tokens: u32,
    /// Number of most-recent turns that are never summarized or truncated.
    pub protected_turns: usize,
    /// Number of oldest turns folded into a single summarization call.
    pub chunk_turns: usize,
    /// Upper bound on tokens requested from the summarizer's response.
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            target_tokens: 100_000,
            protected_turns: 3,
            chunk_turns: 6,
            summary_max_tokens: 800,
        }
    }
}

pub const COMPACTION_PROMPT: &str = "Summarize the conversation turns above so the assistant can continue \
without the original messages. Preserve what was done, what files or \
entities were touched, outstanding requests, and any constraints the user \
stated. Be concise but do not drop anything load-bearing.";

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub messages: Vec<Message>,
    pub turns_summarized: usize,
    pub turns_truncated: usize,
    pub tokens_before: u32,
    pub tokens_after: u32,
}

pub struct Compactor {
    estimator: Arc<dyn TokenEstimator>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(estimator: Arc<dyn TokenEstimator>, config: CompactionConfig) -> Self {
        Self { estimator, config }
    }

    fn message_tokens(&self, message: &Message) -> u32 {
        self.estimator.estimate_text(&message.content) + MESSAGE_OVERHEAD_TOKENS
    }

    fn total_tokens(&self, messages: &[Message]) -> u32 {
        messages.iter().map(|m| self.message_tokens(m)).sum()
    }

    /// Split messages into turns: each turn begins at a `User` message
    /// (or, for a leading run with no preceding user message, at index 0)
    /// and extends through everything up to the next `User` message.
    fn split_turns(messages: &[Message]) -> Vec<Vec<Message>> {
        let mut turns: Vec<Vec<Message>> = Vec::new();
        for message in messages {
            let starts_new_turn = message.role == Role::User || turns.is_empty();
            if starts_new_turn {
                turns.push(vec![message.clone()]);
            } else {
                turns.last_mut().expect("turns non-empty after first push").push(message.clone());
            }
        }
        turns
    }

    /// Compact `messages` down toward `target_tokens`, calling `brain` to
    /// summarize the oldest non-protected turns in chunks. Returns the
    /// rewritten message list whether or not the target was reached; a
    /// cancellation request is honored between chunks and leaves whatever
    /// compaction has completed so far in place.
    pub async fn compact(
        &self,
        messages: &[Message],
        brain: &dyn ChatBrain,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome, AgentError> {
        let tokens_before = self.total_tokens(messages);
        if tokens_before <= self.config.target_tokens {
            return Ok(CompactionOutcome {
                messages: messages.to_vec(),
                turns_summarized: 0,
                turns_truncated: 0,
                tokens_before,
                tokens_after: tokens_before,
            });
        }

        let mut turns = Self::split_turns(messages);
        let mut turns_summarized = 0;
        let mut turns_truncated = 0;

        loop {
            let current_tokens: u32 = turns.iter().flatten().map(|m| self.message_tokens(m)).sum();
            if current_tokens <= self.config.target_tokens {
                break;
            }
            if turns.len() <= self.config.protected_turns {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            let compactable = turns.len() - self.config.protected_turns;
            let chunk_size = self.config.chunk_turns.min(compactable).max(1);
            let chunk: Vec<Message> = turns[..chunk_size].iter().flatten().cloned().collect();

            match self.summarize_chunk(&chunk, brain).await {
                Ok(summary_message) => {
                    turns.splice(0..chunk_size, std::iter::once(vec![summary_message]));
                    turns_summarized += chunk_size;
                }
                Err(e) => {
                    log::warn!("compaction summarization failed, falling back to truncation: {e}");
                    turns.drain(0..chunk_size);
                    turns_truncated += chunk_size;
                }
            }
        }

        let rebuilt: Vec<Message> = turns.into_iter().flatten().collect();
        let tokens_after = self.total_tokens(&rebuilt);

        Ok(CompactionOutcome {
            messages: rebuilt,
            turns_summarized,
            turns_truncated,
            tokens_before,
            tokens_after,
        })
    }

    async fn summarize_chunk(&self, chunk: &[Message], brain: &dyn ChatBrain) -> Result<Message, AgentError> {
        let mut prompt_messages = chunk.to_vec();
        prompt_messages.push(Message::user(COMPACTION_PROMPT, 0));
        let response = brain.quick_chat(&prompt_messages, self.config.summary_max_tokens).await?;
        Ok(Message::system(format!("[earlier conversation summary]\n{}", response.content), 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::HeuristicEstimator;
    use agentry_llm::client::ChatBrain;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBrain {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatBrain for StubBrain {
        async fn quick_chat(&self, _messages: &[Message], _max_tokens: u32) -> Result<Message, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Message::assistant("summary of earlier turns", vec![], 0))
        }
    }

    fn long_conversation(turns: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        for i in 0..turns {
            messages.push(Message::user(format!("question {i}: {}", "x".repeat(2000)), 0));
            messages.push(Message::assistant(format!("answer {i}: {}", "y".repeat(2000)), vec![], 0));
        }
        messages
    }

    #[tokio::test]
    async fn below_budget_conversations_are_left_untouched() {
        let compactor = Compactor::new(Arc::new(HeuristicEstimator), CompactionConfig::default());
        let brain = StubBrain { calls: AtomicUsize::new(0) };
        let messages = long_conversation(1);
        let outcome = compactor.compact(&messages, &brain, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.turns_summarized, 0);
        assert_eq!(outcome.messages.len(), messages.len());
    }

    #[tokio::test]
    async fn over_budget_conversation_summarizes_oldest_turns_first() {
        let config = CompactionConfig {
            target_tokens: 2_000,
            protected_turns: 2,
            chunk_turns: 3,
            summary_max_tokens: 200,
        };
        let compactor = Compactor::new(Arc::new(HeuristicEstimator), config);
        let brain = StubBrain { calls: AtomicUsize::new(0) };
        let messages = long_conversation(10);
        let outcome = compactor.compact(&messages, &brain, &CancellationToken::new()).await.unwrap();
        assert!(outcome.turns_summarized > 0);
        assert!(outcome.tokens_after < outcome.tokens_before);
        assert!(brain.calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn protected_turns_are_never_summarized() {
        let config = CompactionConfig {
            target_tokens: 1,
            protected_turns: 2,
            chunk_turns: 100,
            summary_max_tokens: 200,
        };
        let compactor = Compactor::new(Arc::new(HeuristicEstimator), config);
        let brain = StubBrain { calls: AtomicUsize::new(0) };
        let messages = long_conversation(3);
        let outcome = compactor.compact(&messages, &brain, &CancellationToken::new()).await.unwrap();
        // last 2 turns (4 messages) survive untouched regardless of target.
        let tail: Vec<_> = outcome.messages.iter().rev().take(4).collect();
        assert!(tail.iter().any(|m| m.content.contains("question 2")));
    }

    #[test]
    fn split_turns_keeps_tool_call_and_result_together() {
        let call = agentry_core::ToolCall::new("search", serde_json::json!({}));
        let messages = vec![
            Message::user("find it", 0),
            Message::assistant("", vec![call.clone()], 0),
            Message::tool_result(call.id.clone(), "result", 0),
            Message::user("thanks", 0),
        ];
        let turns = Compactor::split_turns(&messages);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].len(), 3);
    }
}
