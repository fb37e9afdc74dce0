//! Post-task retrospect generation and persistence (spec §4.9; persistence
//! shape supplemented per SPEC_FULL §3's "append-only JSON lines keyed by
//! date").

use std::path::PathBuf;
use std::sync::Arc;

use agentry_core::{AgentError, Message, TaskRecord};
use agentry_llm::client::ChatBrain;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

const RETROSPECT_MAX_TOKENS: u32 = 400;

/// The fixed analysis prompt (spec §4.9): complexity, efficiency, errors,
/// improvement suggestions, bounded to a short output.
fn retrospect_prompt(context: &RetrospectContext) -> String {
    format!(
        "Task: {}\nDuration: {:.1}s\nIterations: {}\nTools used: {}\nModel switched: {}\nError: {}\n\n\
         Produce a brief retrospect with four short sections: (a) complexity assessment, \
         (b) efficiency analysis, (c) error analysis, (d) improvement suggestions.",
        context.description,
        context.duration_secs,
        context.iteration_count,
        context.tool_names.join(", "),
        context.model_switched,
        context.error.as_deref().unwrap_or("none"),
    )
}

/// Everything the retrospect prompt needs, extracted from a finished
/// `TaskRecord` so the generator doesn't need the whole task monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrospectContext {
    pub task_id: String,
    pub description: String,
    pub duration_secs: f64,
    pub iteration_count: usize,
    pub tool_names: Vec<String>,
    pub model_switched: bool,
    pub error: Option<String>,
}

impl RetrospectContext {
    pub fn from_task(task: &TaskRecord, duration_secs: f64) -> Self {
        let tool_names = task.iterations.iter().flat_map(|it| it.tool_calls.clone()).collect();
        Self {
            task_id: task.task_id.clone(),
            description: task.description.clone(),
            duration_secs,
            iteration_count: task.iterations.len(),
            tool_names,
            model_switched: task.model_switched,
            error: task.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrospectRecord {
    pub task_id: String,
    pub date: String,
    pub analysis: String,
}

/// Where generated retrospects are durably appended; read-only for later
/// analysis once written (spec §4.9).
#[async_trait::async_trait]
pub trait RetrospectSink: Send + Sync {
    async fn append(&self, record: RetrospectRecord) -> Result<(), AgentError>;
}

/// Test/dev sink that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryRetrospectSink {
    records: parking_lot::Mutex<Vec<RetrospectRecord>>,
}

#[async_trait::async_trait]
impl RetrospectSink for InMemoryRetrospectSink {
    async fn append(&self, record: RetrospectRecord) -> Result<(), AgentError> {
        self.records.lock().push(record);
        Ok(())
    }
}

impl InMemoryRetrospectSink {
    pub fn records(&self) -> Vec<RetrospectRecord> {
        self.records.lock().clone()
    }
}

/// One append-only JSONL file per UTC date, under `directory`.
pub struct FileRetrospectSink {
    directory: PathBuf,
}

impl FileRetrospectSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }
}

#[async_trait::async_trait]
impl RetrospectSink for FileRetrospectSink {
    async fn append(&self, record: RetrospectRecord) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| AgentError::Internal(format!("retrospect directory: {e}")))?;
        let path = self.directory.join(format!("{}.jsonl", record.date));
        let line = serde_json::to_string(&record).map_err(|e| AgentError::Internal(e.to_string()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AgentError::Internal(format!("opening {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        file.write_all(b"\n").await.map_err(|e| AgentError::Internal(e.to_string()))?;
        Ok(())
    }
}

/// Generates a retrospect from a finished task and persists it to the
/// configured sink (spec §4.9).
pub struct RetrospectGenerator {
    brain: Arc<dyn ChatBrain>,
    sink: Arc<dyn RetrospectSink>,
}

impl RetrospectGenerator {
    pub fn new(brain: Arc<dyn ChatBrain>, sink: Arc<dyn RetrospectSink>) -> Self {
        Self { brain, sink }
    }

    pub async fn generate_and_persist(&self, context: RetrospectContext, date: &str) -> Result<String, AgentError> {
        let prompt = retrospect_prompt(&context);
        let response = self.brain.quick_chat(&[Message::user(prompt, 0)], RETROSPECT_MAX_TOKENS).await?;
        self.sink
            .append(RetrospectRecord { task_id: context.task_id, date: date.to_string(), analysis: response.content.clone() })
            .await?;
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubBrain;

    #[async_trait]
    impl ChatBrain for StubBrain {
        async fn quick_chat(&self, _messages: &[Message], _max_tokens: u32) -> Result<Message, AgentError> {
            Ok(Message::assistant("(a) simple (b) efficient (c) no errors (d) none", vec![], 0))
        }
    }

    #[tokio::test]
    async fn generates_and_persists_to_in_memory_sink() {
        let sink = Arc::new(InMemoryRetrospectSink::default());
        let generator = RetrospectGenerator::new(Arc::new(StubBrain), sink.clone());
        let task = TaskRecord::new("investigate outage", "model-a");
        let context = RetrospectContext::from_task(&task, 12.5);
        let analysis = generator.generate_and_persist(context, "2026-07-27").await.unwrap();
        assert!(analysis.contains("simple"));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].date, "2026-07-27");
    }

    #[tokio::test]
    async fn file_sink_appends_one_jsonl_line_per_call() {
        let dir = std::env::temp_dir().join(format!("agentry-retrospect-test-{}", uuid_like()));
        let sink = FileRetrospectSink::new(&dir);
        sink.append(RetrospectRecord { task_id: "t1".into(), date: "2026-07-27".into(), analysis: "ok".into() })
            .await
            .unwrap();
        sink.append(RetrospectRecord { task_id: "t2".into(), date: "2026-07-27".into(), analysis: "ok2".into() })
            .await
            .unwrap();
        let content = tokio::fs::read_to_string(dir.join("2026-07-27.jsonl")).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }
}
