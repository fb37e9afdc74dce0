//! The single-source-of-truth configuration passed at `AgentRuntime`
//! construction (spec §6). Every field defaults per the spec's listed
//! defaults; deserializable from TOML so a caller can ship a config file
//! rather than building the struct by hand.

use serde::{Deserialize, Serialize};

use agentry_llm::health::FailoverConfig;

/// One entry in `llm_fallbacks`: enough to construct and prioritize an
/// adapter without the config crate knowing concrete adapter types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub priority: u32,
}

/// The recognized configuration options from spec §6, flattened into one
/// struct. Nested pieces (failover) reuse the component's own config type
/// rather than duplicating field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub llm_provider: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: Option<u32>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_fallbacks: Vec<ProviderConfig>,

    pub memory_cache_size: u64,
    pub memory_cache_ttl_s: Option<u64>,

    pub tool_timeout_s: u64,
    pub tool_max_parallel: usize,
    pub tool_allow_paths: Vec<String>,
    pub tool_shell_blocklist: Vec<String>,

    pub context_window_tokens: u32,
    pub target_prompt_tokens: Option<u32>,

    pub recent_entity_max: usize,
    pub recent_entity_ttl_s: u64,

    pub max_iterations: usize,
    pub retrospect_threshold_s: u64,
    pub retrospect_enabled: bool,

    pub failover: FailoverConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_provider: "anthropic".to_string(),
            llm_model: String::new(),
            llm_temperature: 0.7,
            llm_max_tokens: None,
            llm_api_key: None,
            llm_base_url: None,
            llm_fallbacks: Vec::new(),

            memory_cache_size: 1000,
            memory_cache_ttl_s: None,

            tool_timeout_s: 30,
            tool_max_parallel: 3,
            tool_allow_paths: Vec::new(),
            tool_shell_blocklist: Vec::new(),

            context_window_tokens: 200_000,
            target_prompt_tokens: None,

            recent_entity_max: 20,
            recent_entity_ttl_s: 300,

            max_iterations: 10,
            retrospect_threshold_s: 60,
            retrospect_enabled: true,

            failover: FailoverConfig::default(),
        }
    }
}

impl AgentConfig {
    /// `target_prompt_tokens` defaults to 60% of the configured context
    /// window when not explicitly set (spec §6).
    pub fn effective_target_prompt_tokens(&self) -> u32 {
        self.target_prompt_tokens
            .unwrap_or_else(|| (self.context_window_tokens as f64 * 0.6) as u32)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, agentry_core::AgentError> {
        toml::from_str(raw).map_err(|e| agentry_core::AgentError::ConfigError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_section_6() {
        let config = AgentConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.tool_max_parallel, 3);
        assert_eq!(config.recent_entity_max, 20);
        assert_eq!(config.retrospect_threshold_s, 60);
        assert!(config.retrospect_enabled);
    }

    #[test]
    fn target_prompt_tokens_defaults_to_60_percent_of_window() {
        let mut config = AgentConfig::default();
        config.context_window_tokens = 100_000;
        config.target_prompt_tokens = None;
        assert_eq!(config.effective_target_prompt_tokens(), 60_000);
    }

    #[test]
    fn explicit_target_prompt_tokens_overrides_the_default() {
        let mut config = AgentConfig::default();
        config.context_window_tokens = 100_000;
        config.target_prompt_tokens = Some(12_345);
        assert_eq!(config.effective_target_prompt_tokens(), 12_345);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = AgentConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed = AgentConfig::from_toml_str(&raw).unwrap();
        assert_eq!(parsed.max_iterations, config.max_iterations);
    }
}
