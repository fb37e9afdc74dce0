//! Assembles the system prompt from a fixed section order, collapsing or
//! dropping the lowest priority sections first when the budget doesn't fit
//! everything.

use agentry_context::{HeuristicEstimator, TokenEstimator};
use agentry_core::{Message, ToolSchema};
use agentry_llm::adapter::AdapterCapabilities;

/// Fixed assembly order: persona first (always present), environment next,
/// then the two memory-derived sections, and finally the tool catalog so
/// it sits closest to the user turn.
///
/// `tool_catalog` carries the full per-tool schemas rather than a
/// pre-collapsed rendering; the assembler itself decides whether to render
/// them in full or collapsed to `name: description` (spec §4.4 step 2).
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub persona: String,
    pub environment: String,
    pub recent_entities: String,
    pub memory_digest: String,
    pub tool_catalog: Vec<ToolSchema>,
    /// Rendered only when the active adapter reports `supports_system_role`;
    /// carries content (e.g. provider-specific steering) that only makes
    /// sense delivered as a hidden system-level block.
    pub hidden_auxiliary: Option<String>,
}

fn render_tool_catalog_full(schemas: &[ToolSchema]) -> String {
    schemas
        .iter()
        .map(|s| format!("{}: {}\nparameters: {}", s.name, s.description, s.parameters))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_tool_catalog_collapsed(schemas: &[ToolSchema]) -> String {
    schemas.iter().map(|s| s.one_line()).collect::<Vec<_>>().join("\n")
}

#[derive(Debug, Clone, Copy)]
pub struct PromptBudget {
    pub max_tokens: u32,
}

impl Default for PromptBudget {
    fn default() -> Self {
        Self { max_tokens: 4_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionId {
    Persona,
    Environment,
    RecentEntities,
    MemoryDigest,
    ToolCatalog,
    HiddenAuxiliary,
}

impl SectionId {
    fn label(self) -> &'static str {
        match self {
            SectionId::Persona => "persona",
            SectionId::Environment => "environment",
            SectionId::RecentEntities => "recent_entities",
            SectionId::MemoryDigest => "memory_digest",
            SectionId::ToolCatalog => "tool_catalog",
            SectionId::HiddenAuxiliary => "hidden_auxiliary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElisionStep {
    Drop(SectionId),
    CollapseToolCatalog,
}

/// Elision priority from first-dropped to last-dropped when the assembled
/// prompt exceeds budget (spec §4.4: memory digest tail, tool descriptions
/// collapsed to name+one-line, recent-entity context, environment details —
/// environment is the last thing dropped). `HiddenAuxiliary` sits outside
/// that spec-defined order; it's provider steering content, not part of the
/// four core sections, so it goes first. Persona and the tool catalog
/// itself are never fully dropped — a prompt without its tool catalog would
/// make the model hallucinate calling conventions, and one without its
/// persona stops being itself — the tool catalog only ever collapses.
const ELISION_ORDER: [ElisionStep; 5] = [
    ElisionStep::Drop(SectionId::HiddenAuxiliary),
    ElisionStep::Drop(SectionId::MemoryDigest),
    ElisionStep::CollapseToolCatalog,
    ElisionStep::Drop(SectionId::RecentEntities),
    ElisionStep::Drop(SectionId::Environment),
];

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub message: Message,
    pub included: Vec<String>,
    pub elided: Vec<String>,
    pub token_estimate: u32,
}

pub struct PromptAssembler {
    estimator: HeuristicEstimator,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptAssembler {
    pub fn new() -> Self {
        Self { estimator: HeuristicEstimator }
    }

    fn sections(&self, inputs: &PromptInputs, capabilities: &AdapterCapabilities) -> Vec<(SectionId, String)> {
        let mut sections = vec![
            (SectionId::Persona, inputs.persona.clone()),
            (SectionId::Environment, inputs.environment.clone()),
            (SectionId::RecentEntities, inputs.recent_entities.clone()),
            (SectionId::MemoryDigest, inputs.memory_digest.clone()),
            (SectionId::ToolCatalog, render_tool_catalog_full(&inputs.tool_catalog)),
        ];
        if capabilities.supports_system_role {
            if let Some(hidden) = &inputs.hidden_auxiliary {
                sections.push((SectionId::HiddenAuxiliary, hidden.clone()));
            }
        }
        sections.into_iter().filter(|(_, content)| !content.trim().is_empty()).collect()
    }

    pub fn assemble(&self, inputs: &PromptInputs, budget: PromptBudget, capabilities: &AdapterCapabilities) -> AssembledPrompt {
        let mut sections = self.sections(inputs, capabilities);
        let mut elided = Vec::new();
        let mut remaining_steps: Vec<ElisionStep> = ELISION_ORDER.to_vec();

        loop {
            let total: u32 = sections.iter().map(|(_, content)| self.estimator.estimate_text(content)).sum();
            if total <= budget.max_tokens {
                break;
            }
            let Some(pos) = remaining_steps.iter().position(|step| match step {
                ElisionStep::Drop(id) => sections.iter().any(|(sid, _)| sid == id),
                ElisionStep::CollapseToolCatalog => sections.iter().any(|(sid, _)| *sid == SectionId::ToolCatalog),
            }) else {
                break;
            };
            match remaining_steps.remove(pos) {
                ElisionStep::Drop(id) => {
                    sections.retain(|(sid, _)| {
                        let keep = *sid != id;
                        if !keep {
                            elided.push(id.label().to_string());
                        }
                        keep
                    });
                }
                ElisionStep::CollapseToolCatalog => {
                    for (sid, content) in sections.iter_mut() {
                        if *sid == SectionId::ToolCatalog {
                            *content = render_tool_catalog_collapsed(&inputs.tool_catalog);
                        }
                    }
                    elided.push("tool_catalog_collapsed".to_string());
                }
            }
        }

        let included: Vec<String> = sections.iter().map(|(sid, _)| sid.label().to_string()).collect();
        let rendered = sections
            .iter()
            .map(|(_, content)| content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");
        let token_estimate = self.estimator.estimate_text(&rendered);

        AssembledPrompt {
            message: Message::system(rendered, token_estimate),
            included,
            elided,
            token_estimate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(supports_system_role: bool) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_system_role,
            max_context_tokens: 128_000,
        }
    }

    fn sample_inputs() -> PromptInputs {
        PromptInputs {
            persona: "You are a helpful assistant.".into(),
            environment: "cwd: /home/user/project".into(),
            recent_entities: "- modified /home/user/project/main.rs".into(),
            memory_digest: "User prefers terse responses.".into(),
            tool_catalog: vec![ToolSchema::new(
                "shell",
                "run a shell command",
                serde_json::json!({"type": "object", "properties": {"command": {"type": "string"}}}),
                vec!["command".to_string()],
            )],
            hidden_auxiliary: Some("internal steering block".into()),
        }
    }

    #[test]
    fn all_sections_included_when_budget_is_generous() {
        let assembler = PromptAssembler::new();
        let prompt = assembler.assemble(&sample_inputs(), PromptBudget { max_tokens: 10_000 }, &capabilities(true));
        assert!(prompt.elided.is_empty());
        assert!(prompt.included.contains(&"tool_catalog".to_string()));
    }

    #[test]
    fn hidden_auxiliary_omitted_without_system_role_support() {
        let assembler = PromptAssembler::new();
        let prompt = assembler.assemble(&sample_inputs(), PromptBudget { max_tokens: 10_000 }, &capabilities(false));
        assert!(!prompt.included.contains(&"hidden_auxiliary".to_string()));
        assert!(!prompt.message.content.contains("internal steering"));
    }

    #[test]
    fn tight_budget_elides_memory_digest_before_persona_or_tools() {
        let assembler = PromptAssembler::new();
        let mut inputs = sample_inputs();
        inputs.memory_digest = "x".repeat(4000);
        let prompt = assembler.assemble(&inputs, PromptBudget { max_tokens: 50 }, &capabilities(true));
        assert!(prompt.elided.contains(&"memory_digest".to_string()));
        assert!(prompt.included.contains(&"persona".to_string()));
        assert!(prompt.included.contains(&"tool_catalog".to_string()));
    }

    #[test]
    fn tool_catalog_collapses_to_one_line_instead_of_being_dropped() {
        let assembler = PromptAssembler::new();
        let mut inputs = sample_inputs();
        inputs.memory_digest = "x".repeat(4000);
        inputs.recent_entities = "x".repeat(4000);
        inputs.hidden_auxiliary = Some("x".repeat(4000));
        let prompt = assembler.assemble(&inputs, PromptBudget { max_tokens: 60 }, &capabilities(true));
        assert!(prompt.elided.contains(&"tool_catalog_collapsed".to_string()));
        assert!(prompt.included.contains(&"tool_catalog".to_string()));
        assert!(prompt.message.content.contains("shell: run a shell command"));
        assert!(!prompt.message.content.contains("parameters:"));
    }

    #[test]
    fn environment_is_the_last_thing_elided_under_extreme_pressure() {
        let assembler = PromptAssembler::new();
        let mut inputs = sample_inputs();
        inputs.memory_digest = "x".repeat(4000);
        inputs.recent_entities = "x".repeat(4000);
        inputs.hidden_auxiliary = Some("x".repeat(4000));
        inputs.environment = "y".repeat(4000);
        let prompt = assembler.assemble(&inputs, PromptBudget { max_tokens: 5 }, &capabilities(true));
        assert!(prompt.elided.contains(&"environment".to_string()));
        assert!(prompt.included.contains(&"persona".to_string()));
        assert!(prompt.included.contains(&"tool_catalog".to_string()));
    }
}
