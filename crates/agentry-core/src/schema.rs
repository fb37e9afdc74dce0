//! The canonical tool-schema contract advertised to LLM adapters (spec §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{name, description, parameters: JSON schema, required}` — the shape
/// every `agentry_llm::adapter::LlmAdapter` translates into its vendor's
/// native tool-definition format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub required: Vec<String>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value, required: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            required,
        }
    }

    /// A one-line `name: description` rendering, used by the prompt
    /// assembler when eliding full tool descriptions under budget pressure
    /// (spec §4.4).
    pub fn one_line(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }
}
