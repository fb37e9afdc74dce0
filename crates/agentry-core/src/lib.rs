//! Canonical data model shared by every component of the agent runtime.
//!
//! This crate has no async runtime dependency and no I/O — it exists so
//! that `agentry-llm`, `agentry-memory`, `agentry-tools` and
//! `agentry-agent` can all speak the same `Message`/`ToolCall`/`AgentError`
//! vocabulary without depending on each other.

pub mod error;
pub mod model;
pub mod schema;

pub use error::AgentError;
pub use model::{
    Conversation, EntityAction, EntityKind, HealthStatus, IterationRecord, MemoryEntry,
    MemoryKind, Message, ProviderHealth, RecentEntity, Role, TaskRecord, Timestamp, ToolCall,
    ToolResult, TokenUsage,
};
pub use schema::ToolSchema;
