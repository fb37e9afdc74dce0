//! Canonical message, tool-call and bookkeeping types (spec §3).
//!
//! These types are immutable once constructed (aside from the mutable
//! bookkeeping fields called out explicitly, e.g. `MemoryEntry::access_count`)
//! and carry no provider-specific shape — adapters translate to/from these.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// A monotonically increasing counter paired with wall-clock time.
///
/// `Message::created_at` needs both a wall-clock reading (for display and
/// for the retriever's time-decay scoring) and a monotonic ordering key
/// that survives clock skew/adjustment within a single process. Using a
/// plain `Instant` would make this type hard to serialize into the
/// durable store, so the monotonic component is a logical sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub wall_clock: OffsetDateTime,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            wall_clock: OffsetDateTime::now_utc(),
        }
    }

    pub fn age(&self, now: OffsetDateTime) -> time::Duration {
        now - self.wall_clock
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// One of {system, user, assistant, tool} (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A function/tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Structured key/value arguments (already parsed from the adapter's
    /// accumulated JSON delta stream, see `agentry_llm::adapter::StreamChunk`).
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            arguments,
        }
    }
}

/// The outcome of executing a single `ToolCall` (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub truncated: bool,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            output: output.into(),
            error: None,
            duration_ms,
            truncated: false,
        }
    }

    pub fn failed(tool_call_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_ms,
            truncated: false,
        }
    }
}

/// An immutable conversation message (spec §3).
///
/// Invariant: every `Role::Tool` message's `tool_call_id` must reference
/// exactly one `ToolCall::id` from the immediately preceding
/// `Role::Assistant` message. Compaction (`agentry_context::compactor`)
/// must never split such a pair across a boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub created_at: Timestamp,
    pub token_estimate: u32,
}

impl Message {
    pub fn user(content: impl Into<String>, token_estimate: u32) -> Self {
        Self {
            id: new_id(),
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Timestamp::now(),
            token_estimate,
        }
    }

    pub fn system(content: impl Into<String>, token_estimate: u32) -> Self {
        Self {
            id: new_id(),
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Timestamp::now(),
            token_estimate,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>, token_estimate: u32) -> Self {
        Self {
            id: new_id(),
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            created_at: Timestamp::now(),
            token_estimate,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>, token_estimate: u32) -> Self {
        Self {
            id: new_id(),
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            created_at: Timestamp::now(),
            token_estimate,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A stored conversation (spec §3). Owned exclusively by the memory store;
/// the agent holds a working copy (`Vec<Message>`) during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
    pub created_at: Timestamp,
    pub title: String,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            created_at: Timestamp::now(),
            title: String::new(),
        }
    }
}

/// The kind of a `MemoryEntry` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Interaction,
    Insight,
    Entity,
}

/// A durable memory record, either a raw interaction or a derived insight
/// (spec §3, §4.5, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub conversation_id: Option<String>,
    pub kind: MemoryKind,
    pub content: String,
    pub keywords: HashSet<String>,
    pub importance: f32,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
    pub access_count: u64,
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    pub fn new(
        kind: MemoryKind,
        content: impl Into<String>,
        keywords: HashSet<String>,
        importance: f32,
        conversation_id: Option<String>,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: new_id(),
            conversation_id,
            kind,
            content: content.into(),
            keywords,
            importance: importance.clamp(0.0, 1.0),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            embedding: None,
        }
    }
}

/// The kind of filesystem/network object a `RecentEntity` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    File,
    Folder,
    Url,
    Other,
}

/// The action the user/agent took on a `RecentEntity` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Create,
    Delete,
    Copy,
    Move,
    Open,
    Modify,
}

/// A short-lived in-process record of a file/folder/URL the user acted on,
/// used to resolve anaphoric references ("delete it") (spec §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentEntity {
    pub kind: EntityKind,
    pub name: String,
    pub action: EntityAction,
    pub location: String,
    pub timestamp: Timestamp,
}

/// Health status of an LLM provider (spec §3, §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Per-provider health state tracked by the failover health monitor
/// (spec §3, §4.10). Invariant: a provider with `status == Unhealthy` and
/// `cooldown_until` in the future must not be offered for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub name: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cooldown_until: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            cooldown_until: None,
            last_error: None,
        }
    }

    pub fn is_available(&self, now: OffsetDateTime) -> bool {
        match (self.status, self.cooldown_until) {
            (HealthStatus::Unhealthy, Some(until)) => now >= until,
            _ => true,
        }
    }
}

/// One LLM call within the agent's loop for a single user turn (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: usize,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub tool_calls: Vec<String>,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

impl IterationRecord {
    pub fn begin(index: usize, model: impl Into<String>) -> Self {
        Self {
            index,
            model: model.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            tool_calls: Vec::new(),
            started_at: Timestamp::now(),
            ended_at: None,
        }
    }
}

/// A per-task metrics record (spec §3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub description: String,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub iterations: Vec<IterationRecord>,
    pub initial_model: String,
    pub final_model: String,
    pub model_switched: bool,
    pub success: bool,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn new(description: impl Into<String>, initial_model: impl Into<String>) -> Self {
        let model = initial_model.into();
        Self {
            task_id: new_id(),
            description: description.into(),
            started_at: Timestamp::now(),
            ended_at: None,
            iterations: Vec::new(),
            initial_model: model.clone(),
            final_model: model,
            model_switched: false,
            success: false,
            error: None,
        }
    }
}

/// Per-provider token accounting, accumulated per iteration/task/day
/// (spec §3). Addable so callers can roll iteration usage up into task and
/// daily totals without re-deriving the arithmetic at each level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
    pub estimated_cost: f64,
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
            cache_read: self.cache_read + rhs.cache_read,
            cache_creation: self.cache_creation + rhs.cache_creation,
            estimated_cost: self.estimated_cost + rhs.estimated_cost,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}
