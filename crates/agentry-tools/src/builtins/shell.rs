//! Shell tool: runs a command through `/bin/sh -c`, gated by a blocklist of
//! destructive command prefixes.

use agentry_core::{AgentError, ToolSchema};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::registry::Tool;

/// Command prefixes refused outright regardless of working directory —
/// these are the common destructive one-liners, not an exhaustive sandbox.
const BLOCKED_PREFIXES: &[&str] = &["rm -rf /", "mkfs", "dd if=", ":(){ :|:& };:", "shutdown", "reboot", "> /dev/sda"];

pub struct ShellTool {
    pub timeout: std::time::Duration,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self { timeout: std::time::Duration::from_secs(30) }
    }
}

fn is_blocked(command: &str) -> Option<&'static str> {
    let normalized = command.trim();
    BLOCKED_PREFIXES.iter().find(|blocked| normalized.contains(*blocked)).copied()
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "shell",
            "Run a shell command and return its combined stdout/stderr.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Command to run via /bin/sh -c." },
                    "workdir": { "type": "string", "description": "Working directory for the command." }
                },
                "required": ["command"]
            }),
            vec!["command".to_string()],
        )
    }

    fn exclusive_key(&self, args: &Value) -> Option<String> {
        args.get("workdir").and_then(Value::as_str).map(|dir| format!("shell:{dir}"))
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ToolValidation { tool: "shell".into(), message: "command is required".into() })?;

        if let Some(blocked) = is_blocked(command) {
            return Err(AgentError::ToolSecurity {
                tool: "shell".into(),
                reason: format!("command matches blocked pattern: {blocked}"),
            });
        }

        let mut builder = tokio::process::Command::new("/bin/sh");
        builder.arg("-c").arg(command);
        if let Some(workdir) = args.get("workdir").and_then(Value::as_str) {
            builder.current_dir(workdir);
        }

        let output = tokio::time::timeout(self.timeout, builder.output())
            .await
            .map_err(|_| AgentError::ToolTimeout { tool: "shell".into(), timeout_secs: self.timeout.as_secs() })?
            .map_err(|e| AgentError::ToolExecution { tool: "shell".into(), message: e.to_string() })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(format!("exit_code={}\nstdout:\n{stdout}\nstderr:\n{stderr}", output.status.code().unwrap_or(-1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_patterns_are_rejected_before_spawning() {
        assert_eq!(is_blocked("rm -rf /"), Some("rm -rf /"));
        assert_eq!(is_blocked("ls -la"), None);
    }

    #[tokio::test]
    async fn echo_command_returns_stdout() {
        let tool = ShellTool::default();
        let result = tool.execute(json!({"command": "echo hi"})).await.unwrap();
        assert!(result.contains("hi"));
        assert!(result.contains("exit_code=0"));
    }

    #[tokio::test]
    async fn blocked_command_is_refused_as_security_error() {
        let tool = ShellTool::default();
        let err = tool.execute(json!({"command": "rm -rf / --no-preserve-root"})).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolSecurity { .. }));
    }
}
