//! Completion verification (spec §4.8): a deterministic predicate runs
//! first, and only falls through to a bounded LLM call when that check is
//! inconclusive (spec §9 Open Question, resolved as "invoke when the
//! deterministic check is inconclusive").

use agentry_core::{AgentError, Message, ToolResult};
use agentry_llm::client::ChatBrain;

/// Phrases that claim a delivery artifact was produced; used by the
/// deterministic check to catch a model asserting "I've created the
/// file" without a tool result backing that claim up.
const DELIVERY_CLAIM_MARKERS: &[&str] = &["i've created", "i have created", "i've saved", "i have saved", "done, the file", "i've sent", "i have sent"];

const PENDING_STEP_MARKERS: &[&str] = &["next i will", "next, i will", "still need to", "i still need to", "remaining steps", "todo:"];

const VERIFY_PROMPT_MAX_TOKENS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Complete,
    Incomplete,
}

/// The deterministic half of completion verification: fast, free, and run
/// unconditionally before any LLM call.
///
/// Returns `None` when the deterministic check can't decide either way
/// (the caller should then ask the LLM); `Some(verdict)` when it can.
fn deterministic_check(assistant_message: &Message, tool_results: &[ToolResult]) -> Option<Verdict> {
    let lowered = assistant_message.content.to_lowercase();

    let claims_delivery = DELIVERY_CLAIM_MARKERS.iter().any(|marker| lowered.contains(marker));
    if claims_delivery {
        let any_tool_succeeded = tool_results.iter().any(|r| r.success);
        if !any_tool_succeeded {
            return Some(Verdict::Incomplete);
        }
    }

    if PENDING_STEP_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return Some(Verdict::Incomplete);
    }

    None
}

/// Runs the §4.8 completion check for a turn that just produced an
/// assistant message with no further tool calls. `tool_results` covers
/// every tool call made earlier in *this* turn, so the delivery-claim
/// check can see whether anything actually ran.
pub struct Verifier;

impl Verifier {
    /// `is_complete` bounds its own cost: the LLM step only runs when the
    /// deterministic check returns `None` (spec §4.8, §9 OQ2).
    pub async fn is_complete(
        assistant_message: &Message,
        last_user_text: &str,
        tool_results: &[ToolResult],
        brain: &dyn ChatBrain,
    ) -> Result<bool, AgentError> {
        if let Some(verdict) = deterministic_check(assistant_message, tool_results) {
            return Ok(verdict == Verdict::Complete);
        }

        let prompt = format!(
            "User request: {last_user_text}\n\nAssistant's last message: {}\n\nIs the user's request satisfied by this message, given the tool results? Answer yes or no, then one reason.",
            assistant_message.content
        );
        let response = brain.quick_chat(&[Message::user(prompt, 0)], VERIFY_PROMPT_MAX_TOKENS).await?;
        let answer = response.content.trim_start().to_lowercase();
        Ok(answer.starts_with("yes"))
    }
}
