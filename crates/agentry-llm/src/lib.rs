//! The LLM provider adapter trait (C2), the retrying/failover client (C3),
//! and the cooldown-based health monitor (C11) — spec §4.1, §4.2, §4.10.

pub mod adapter;
pub mod client;
pub mod health;

pub use adapter::{AdapterCapabilities, ChatParams, LlmAdapter, StreamChunk, ToolCallAccumulator, ToolChoice};
pub use client::{AdapterEntry, ChatBrain, LlmClient, RetryPolicy};
pub use health::{FailoverConfig, HealthMonitor};
