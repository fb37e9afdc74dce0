//! `AgentRuntime`: the explicit handle an operator constructs once at
//! startup and passes into every turn, replacing the process-wide
//! singletons the teacher used for health state and the recent-entity
//! cache (spec §9 "Global state").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use agentry_context::{Compactor, HeuristicEstimator};
use agentry_core::{AgentError, TokenUsage};
use agentry_llm::client::LlmClient;
use agentry_llm::health::HealthMonitor;
use agentry_memory::{MemoryStore, RecentEntityTracker, Retriever};
use agentry_prompt::PromptAssembler;
use agentry_tools::executor::Executor;
use agentry_tools::registry::ToolRegistry;
use parking_lot::Mutex;

use crate::config::AgentConfig;
use crate::retrospect::RetrospectGenerator;
use crate::task_monitor::TaskMonitor;

/// Three-section persona bundle (spec §4.4): SOUL, AGENT, USER markdown,
/// concatenated by the prompt assembler. Loading these from disk is out
/// of scope (spec §1) — the runtime is handed the already-read text.
#[derive(Debug, Clone, Default)]
pub struct PersonaBundle {
    pub soul: String,
    pub agent: String,
    pub user: String,
}

impl PersonaBundle {
    pub fn render(&self) -> String {
        [&self.soul, &self.agent, &self.user]
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Rolling counters surfaced by `status()` (spec §6).
#[derive(Default)]
pub struct RuntimeTotals {
    pub conversations: AtomicU64,
    pub tool_calls: AtomicU64,
    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,
}

impl RuntimeTotals {
    pub fn record_turn(&self) {
        self.conversations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_calls(&self, n: u64) {
        self.tool_calls.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_usage(&self, usage: TokenUsage) {
        self.input_tokens.fetch_add(usage.input, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output, Ordering::Relaxed);
    }
}

pub struct HealthReport {
    pub ok: bool,
    pub degraded: bool,
    pub memory_count: u64,
    pub tool_count: usize,
    pub active_provider: Option<String>,
    pub active_model: String,
}

pub struct StatusReport {
    pub busy: bool,
    pub current_task: Option<String>,
    pub uptime_s: f64,
    pub total_conversations: u64,
    pub total_tool_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub memory_count: u64,
    pub tool_count: usize,
    pub active_provider: Option<String>,
    pub active_model: String,
}

/// Every shared handle a turn needs, constructed once and torn down once
/// (spec §9 "Lifecycle: runtime constructed once, torn down once; no
/// re-entrant init").
pub struct AgentRuntime {
    pub config: AgentConfig,
    pub llm_client: Arc<LlmClient>,
    pub health: Arc<HealthMonitor>,
    pub memory: Arc<dyn MemoryStore>,
    pub retriever: Arc<Retriever>,
    pub tools: Arc<ToolRegistry>,
    pub executor: Arc<Executor>,
    pub compactor: Arc<Compactor>,
    pub assembler: Arc<PromptAssembler>,
    pub persona: PersonaBundle,
    pub recent_entities: Mutex<RecentEntityTracker>,
    pub task_monitor: Arc<TaskMonitor>,
    pub retrospect: Option<Arc<RetrospectGenerator>>,
    pub totals: RuntimeTotals,
    pub busy: std::sync::atomic::AtomicBool,
    pub current_task: Mutex<Option<String>>,
    started_at: Instant,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        llm_client: Arc<LlmClient>,
        health: Arc<HealthMonitor>,
        memory: Arc<dyn MemoryStore>,
        retriever: Arc<Retriever>,
        tools: Arc<ToolRegistry>,
        executor: Arc<Executor>,
        persona: PersonaBundle,
        retrospect: Option<Arc<RetrospectGenerator>>,
    ) -> Self {
        let recent_entities = RecentEntityTracker::new(config.recent_entity_max, std::time::Duration::from_secs(config.recent_entity_ttl_s));
        let compactor = Compactor::new(
            Arc::new(HeuristicEstimator),
            agentry_context::CompactionConfig {
                target_tokens: config.effective_target_prompt_tokens(),
                ..Default::default()
            },
        );

        Self {
            config,
            llm_client,
            health,
            memory,
            retriever,
            tools,
            executor,
            compactor: Arc::new(compactor),
            assembler: Arc::new(PromptAssembler::new()),
            persona,
            recent_entities: Mutex::new(recent_entities),
            task_monitor: Arc::new(TaskMonitor::new()),
            retrospect,
            totals: RuntimeTotals::default(),
            busy: std::sync::atomic::AtomicBool::new(false),
            current_task: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    pub async fn health(&self) -> Result<HealthReport, AgentError> {
        let memory_count = self.memory.list_recent(usize::MAX.min(10_000)).await.map(|v| v.len() as u64).unwrap_or(0);
        let provider = self.llm_client.active_provider_name().map(str::to_string);
        let degraded = provider.is_none();
        Ok(HealthReport {
            ok: !degraded,
            degraded,
            memory_count,
            tool_count: self.tools.len(),
            active_provider: provider,
            active_model: self.config.llm_model.clone(),
        })
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            busy: self.busy.load(Ordering::Relaxed),
            current_task: self.current_task.lock().clone(),
            uptime_s: self.started_at.elapsed().as_secs_f64(),
            total_conversations: self.totals.conversations.load(Ordering::Relaxed),
            total_tool_calls: self.totals.tool_calls.load(Ordering::Relaxed),
            total_input_tokens: self.totals.input_tokens.load(Ordering::Relaxed),
            total_output_tokens: self.totals.output_tokens.load(Ordering::Relaxed),
            memory_count: 0,
            tool_count: self.tools.len(),
            active_provider: self.llm_client.active_provider_name().map(str::to_string),
            active_model: self.config.llm_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_bundle_skips_empty_sections() {
        let persona = PersonaBundle { soul: "soul text".into(), agent: String::new(), user: "user text".into() };
        assert_eq!(persona.render(), "soul text\n\nuser text");
    }
}
