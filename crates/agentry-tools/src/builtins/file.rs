//! File read tool: resolves symlinks before checking the result against an
//! allow-list of permitted root directories, so a symlink can't be used to
//! read outside the sandbox it appears to live in.

use std::path::{Path, PathBuf};

use agentry_core::{AgentError, ToolSchema};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::registry::Tool;

pub struct ReadFileTool {
    pub allowed_roots: Vec<PathBuf>,
    pub max_bytes: usize,
}

impl ReadFileTool {
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots, max_bytes: 1_000_000 }
    }

    fn resolve_within_allowed_roots(&self, path: &Path) -> Result<PathBuf, AgentError> {
        let canonical = std::fs::canonicalize(path)
            .map_err(|e| AgentError::ToolExecution { tool: "read_file".into(), message: format!("cannot resolve {}: {e}", path.display()) })?;

        let allowed = self.allowed_roots.iter().any(|root| {
            std::fs::canonicalize(root).map(|canonical_root| canonical.starts_with(canonical_root)).unwrap_or(false)
        });

        if !allowed {
            return Err(AgentError::ToolSecurity {
                tool: "read_file".into(),
                reason: format!("{} resolves outside the allowed roots", path.display()),
            });
        }
        Ok(canonical)
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "read_file",
            "Read a file's contents. Refuses paths outside the configured allow-list.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Absolute or relative path to read." }
                },
                "required": ["path"]
            }),
            vec!["path".to_string()],
        )
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ToolValidation { tool: "read_file".into(), message: "path is required".into() })?;

        let resolved = self.resolve_within_allowed_roots(Path::new(path))?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| AgentError::ToolExecution { tool: "read_file".into(), message: e.to_string() })?;

        let truncated = bytes.len() > self.max_bytes;
        let slice = &bytes[..bytes.len().min(self.max_bytes)];
        let content = String::from_utf8_lossy(slice).into_owned();
        if truncated {
            Ok(format!("{content}\n[... truncated, file exceeds {} bytes]", self.max_bytes))
        } else {
            Ok(content)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_file_inside_allowed_root() {
        let dir = std::env::temp_dir().join(format!("agentry-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file_path = dir.join("hello.txt");
        std::fs::File::create(&file_path).unwrap().write_all(b"hello world").unwrap();

        let tool = ReadFileTool::new(vec![dir.clone()]);
        let result = tool.execute(json!({"path": file_path.to_str().unwrap()})).await.unwrap();
        assert_eq!(result, "hello world");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn refuses_path_outside_allowed_roots() {
        let allowed_dir = std::env::temp_dir().join(format!("agentry-allowed-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&allowed_dir).unwrap();
        let outside_dir = std::env::temp_dir().join(format!("agentry-outside-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&outside_dir).unwrap();
        let outside_file = outside_dir.join("secret.txt");
        std::fs::File::create(&outside_file).unwrap().write_all(b"nope").unwrap();

        let tool = ReadFileTool::new(vec![allowed_dir.clone()]);
        let err = tool.execute(json!({"path": outside_file.to_str().unwrap()})).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolSecurity { .. }));

        std::fs::remove_dir_all(&allowed_dir).ok();
        std::fs::remove_dir_all(&outside_dir).ok();
    }
}
