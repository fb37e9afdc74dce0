//! The tool trait and the registry of tools available to a run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agentry_core::{AgentError, ToolSchema};
use async_trait::async_trait;
use serde_json::Value;

/// A tool's declared data (spec §4.7: `name`, `description`,
/// `parameter_schema`, `required_params`, `timeout_default`, `category`).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> ToolSchema;

    /// Names that must be present (and non-null) in `args` before a call
    /// is dispatched. Defaults to the schema's own `required` list, which
    /// covers most tools; override when a tool accepts a superset of its
    /// schema's required fields as actually-required at call time.
    fn required_params(&self) -> Vec<String> {
        self.schema().required
    }

    /// Per-tool timeout override. `None` defers to the executor's
    /// configured default.
    fn timeout_default(&self) -> Option<Duration> {
        None
    }

    /// A coarse grouping surfaced in status/introspection (e.g. "shell",
    /// "file", "web"). Defaults to the tool's own name.
    fn category(&self) -> &str {
        self.name()
    }

    /// Tools that share an exclusive key never run concurrently with each
    /// other (e.g. two writes to the same file), regardless of how the
    /// dependency graph lays out waves. `None` means this call has no
    /// exclusivity constraint.
    fn exclusive_key(&self, _args: &Value) -> Option<String> {
        None
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError>;
}

/// Validate `args` against a tool's `required_params` (spec §4.7 step 1):
/// every required name must be present and non-null. Schema-shape
/// validation (types, formats) is left to each tool's own `execute`, as
/// `parameter_schema` is advisory JSON Schema rather than a compiled
/// validator in this runtime.
pub fn validate_args(tool: &dyn Tool, args: &Value) -> Result<(), AgentError> {
    for param in tool.required_params() {
        let present = args.get(&param).map(|v| !v.is_null()).unwrap_or(false);
        if !present {
            return Err(AgentError::ToolValidation {
                tool: tool.name().to_string(),
                message: format!("missing required parameter `{param}`"),
            });
        }
    }
    Ok(())
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|tool| tool.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn schema(&self) -> ToolSchema {
            ToolSchema::new("echo", "echoes its input", json!({"type": "object"}), vec![])
        }
        async fn execute(&self, args: Value) -> Result<String, AgentError> {
            Ok(args.to_string())
        }
    }

    struct Greet;

    #[async_trait]
    impl Tool for Greet {
        fn name(&self) -> &str {
            "greet"
        }
        fn schema(&self) -> ToolSchema {
            ToolSchema::new(
                "greet",
                "greets someone by name",
                json!({"type": "object", "properties": {"name": {"type": "string"}}}),
                vec!["name".to_string()],
            )
        }
        async fn execute(&self, args: Value) -> Result<String, AgentError> {
            Ok(format!("hello, {}", args.get("name").and_then(Value::as_str).unwrap_or_default()))
        }
    }

    #[test]
    fn registered_tool_is_findable_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        assert!(registry.find("echo").is_some());
        assert!(registry.find("missing").is_none());
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let schemas = registry.schemas();
        assert_eq!(schemas[0].name, "echo");
    }

    #[test]
    fn validate_args_rejects_a_missing_required_parameter() {
        let err = validate_args(&Greet, &json!({})).unwrap_err();
        assert!(matches!(err, AgentError::ToolValidation { .. }));
    }

    #[test]
    fn validate_args_accepts_a_fully_populated_call() {
        assert!(validate_args(&Greet, &json!({"name": "Ada"})).is_ok());
    }

    #[test]
    fn required_params_defaults_to_the_schema_required_list() {
        assert_eq!(Greet.required_params(), vec!["name".to_string()]);
        assert!(Echo.required_params().is_empty());
    }
}
