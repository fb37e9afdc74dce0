//! Unified error taxonomy for the agent runtime (spec §7).

use thiserror::Error;

/// Every error kind surfaced by the core, with the propagation policy from
/// spec §7 implemented by `retriable()` and by callers matching on variants
/// rather than inspecting strings.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("LLM connection error: {0}")]
    LlmConnection(String),

    #[error("LLM rate limited: {message}")]
    LlmRateLimit {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("LLM context window overflow: {0}")]
    LlmContextOverflow(String),

    #[error("invalid LLM request: {0}")]
    LlmInvalidRequest(String),

    #[error("LLM upstream server error ({status}): {message}")]
    LlmUpstream5xx { status: u16, message: String },

    #[error("malformed LLM response: {0}")]
    LlmResponseMalformed(String),

    #[error("all providers failed: {0}")]
    LlmAllProvidersFailed(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool argument validation failed for `{tool}`: {message}")]
    ToolValidation { tool: String, message: String },

    #[error("tool `{tool}` timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("tool `{tool}` rejected by security policy: {reason}")]
    ToolSecurity { tool: String, reason: String },

    #[error("tool `{tool}` execution failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("memory storage error: {0}")]
    MemoryStorage(String),

    #[error("memory retrieval error: {0}")]
    MemoryRetrieval(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether a caller may usefully retry the same operation (spec §6/§7
    /// user-visible failure contract: `{kind, message, retriable}`).
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            AgentError::LlmConnection(_)
                | AgentError::LlmRateLimit { .. }
                | AgentError::LlmUpstream5xx { .. }
                | AgentError::MemoryRetrieval(_)
        )
    }

    /// A short machine-stable tag for the `{kind, message, retriable}`
    /// contract (spec §6), distinct from the human `Display` message.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::ConfigError(_) => "config_error",
            AgentError::LlmConnection(_) => "llm_connection",
            AgentError::LlmRateLimit { .. } => "llm_rate_limit",
            AgentError::LlmContextOverflow(_) => "llm_context_overflow",
            AgentError::LlmInvalidRequest(_) => "llm_invalid_request",
            AgentError::LlmUpstream5xx { .. } => "llm_upstream_5xx",
            AgentError::LlmResponseMalformed(_) => "llm_response_malformed",
            AgentError::LlmAllProvidersFailed(_) => "llm_all_providers_failed",
            AgentError::ToolNotFound(_) => "tool_not_found",
            AgentError::ToolValidation { .. } => "tool_validation",
            AgentError::ToolTimeout { .. } => "tool_timeout",
            AgentError::ToolSecurity { .. } => "tool_security",
            AgentError::ToolExecution { .. } => "tool_execution",
            AgentError::MemoryStorage(_) => "memory_storage",
            AgentError::MemoryRetrieval(_) => "memory_retrieval",
            AgentError::Cancelled => "cancelled",
            AgentError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_connection_errors_are_retriable() {
        assert!(AgentError::LlmConnection("boom".into()).retriable());
        assert!(AgentError::LlmRateLimit {
            message: "slow down".into(),
            retry_after_secs: Some(5)
        }
        .retriable());
    }

    #[test]
    fn context_overflow_and_invalid_request_are_terminal() {
        assert!(!AgentError::LlmContextOverflow("too big".into()).retriable());
        assert!(!AgentError::LlmInvalidRequest("bad param".into()).retriable());
    }
}
