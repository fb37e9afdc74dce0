//! Durable memory storage: an FTS5-backed SQLite table doubles as both the
//! record store and the keyword index, so there is exactly one place that
//! can disagree with itself about what's in memory.

use std::path::Path;
use std::sync::Arc;

use agentry_core::{AgentError, Conversation, MemoryEntry, MemoryKind, Message, Role, Timestamp, ToolCall};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tokio::sync::Mutex;

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn insert(&self, entry: MemoryEntry) -> Result<(), AgentError>;
    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, AgentError>;
    /// Full-text keyword search over `content`, newest-ranked-first by FTS5's bm25.
    async fn search_keyword(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, AgentError>;
    async fn list_recent(&self, limit: usize) -> Result<Vec<MemoryEntry>, AgentError>;
    async fn record_access(&self, id: &str) -> Result<(), AgentError>;
    async fn delete(&self, id: &str) -> Result<(), AgentError>;

    /// Load a conversation's messages in order (spec §4.5). Returns an
    /// empty conversation (not an error) if `id` has never been saved.
    async fn load_conversation(&self, id: &str) -> Result<Conversation, AgentError>;
    /// Append-semantics save: messages already present by `id` are left
    /// untouched, new ones are appended in the order given (spec §4.5,
    /// "idempotent per message id").
    async fn save_conversation(&self, id: &str, messages: &[Message], title: &str) -> Result<(), AgentError>;
}

pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemoryStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref().to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(path)?;
            apply_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| AgentError::MemoryStorage(e.to_string()))?
        .map_err(|e| AgentError::MemoryStorage(e.to_string()))?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn open_in_memory() -> Result<Self, AgentError> {
        let conn = Connection::open_in_memory().map_err(|e| AgentError::MemoryStorage(e.to_string()))?;
        apply_schema(&conn).map_err(|e| AgentError::MemoryStorage(e.to_string()))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }
}

fn apply_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS memory_entries (
            id TEXT PRIMARY KEY,
            conversation_id TEXT,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            keywords TEXT NOT NULL,
            importance REAL NOT NULL,
            created_at_seq INTEGER NOT NULL,
            created_at_wall TEXT NOT NULL,
            last_accessed_seq INTEGER NOT NULL,
            last_accessed_wall TEXT NOT NULL,
            access_count INTEGER NOT NULL,
            embedding BLOB
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
            id UNINDEXED,
            content,
            keywords,
            content='memory_entries',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS memory_entries_ai AFTER INSERT ON memory_entries BEGIN
            INSERT INTO memory_fts(rowid, id, content, keywords)
            VALUES (new.rowid, new.id, new.content, new.keywords);
        END;

        CREATE TRIGGER IF NOT EXISTS memory_entries_ad AFTER DELETE ON memory_entries BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, id, content, keywords)
            VALUES ('delete', old.rowid, old.id, old.content, old.keywords);
        END;

        CREATE TRIGGER IF NOT EXISTS memory_entries_au AFTER UPDATE ON memory_entries BEGIN
            INSERT INTO memory_fts(memory_fts, rowid, id, content, keywords)
            VALUES ('delete', old.rowid, old.id, old.content, old.keywords);
            INSERT INTO memory_fts(rowid, id, content, keywords)
            VALUES (new.rowid, new.id, new.content, new.keywords);
        END;

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL DEFAULT '',
            created_at_seq INTEGER NOT NULL,
            created_at_wall TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_messages (
            conversation_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            tool_calls TEXT NOT NULL,
            tool_call_id TEXT,
            created_at_seq INTEGER NOT NULL,
            created_at_wall TEXT NOT NULL,
            token_estimate INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, message_id)
        );
        "#,
    )
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn role_from_str(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role: String = row.get("role")?;
    let tool_calls_json: String = row.get("tool_calls")?;
    let tool_calls: Vec<ToolCall> = serde_json::from_str(&tool_calls_json).unwrap_or_default();
    let created_at_wall: String = row.get("created_at_wall")?;
    Ok(Message {
        id: row.get("message_id")?,
        role: role_from_str(&role),
        content: row.get("content")?,
        tool_calls,
        tool_call_id: row.get("tool_call_id")?,
        created_at: Timestamp {
            sequence: row.get("created_at_seq")?,
            wall_clock: OffsetDateTime::parse(&created_at_wall, &time::format_description::well_known::Rfc3339)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        },
        token_estimate: row.get::<_, i64>("token_estimate")? as u32,
    })
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<MemoryEntry> {
    let kind: String = row.get("kind")?;
    let keywords: String = row.get("keywords")?;
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    let created_at_wall: String = row.get("created_at_wall")?;
    let last_accessed_wall: String = row.get("last_accessed_wall")?;

    Ok(MemoryEntry {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        kind: match kind.as_str() {
            "insight" => MemoryKind::Insight,
            "entity" => MemoryKind::Entity,
            _ => MemoryKind::Interaction,
        },
        content: row.get("content")?,
        keywords: keywords.split('\u{1f}').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        importance: row.get("importance")?,
        created_at: Timestamp {
            sequence: row.get("created_at_seq")?,
            wall_clock: OffsetDateTime::parse(&created_at_wall, &time::format_description::well_known::Rfc3339)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        },
        last_accessed_at: Timestamp {
            sequence: row.get("last_accessed_seq")?,
            wall_clock: OffsetDateTime::parse(&last_accessed_wall, &time::format_description::well_known::Rfc3339)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        },
        access_count: row.get::<_, i64>("access_count")? as u64,
        embedding: embedding.map(|bytes| {
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }),
    })
}

fn kind_str(kind: MemoryKind) -> &'static str {
    match kind {
        MemoryKind::Interaction => "interaction",
        MemoryKind::Insight => "insight",
        MemoryKind::Entity => "entity",
    }
}

fn encode_embedding(embedding: &Option<Vec<f32>>) -> Option<Vec<u8>> {
    embedding.as_ref().map(|values| values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn insert(&self, entry: MemoryEntry) -> Result<(), AgentError> {
        let conn = self.conn.lock().await;
        let keywords_joined = entry.keywords.iter().cloned().collect::<Vec<_>>().join("\u{1f}");
        let rfc3339 = time::format_description::well_known::Rfc3339;
        conn.execute(
            "INSERT OR REPLACE INTO memory_entries
                (id, conversation_id, kind, content, keywords, importance,
                 created_at_seq, created_at_wall, last_accessed_seq, last_accessed_wall,
                 access_count, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.id,
                entry.conversation_id,
                kind_str(entry.kind),
                entry.content,
                keywords_joined,
                entry.importance,
                entry.created_at.sequence,
                entry.created_at.wall_clock.format(&rfc3339).unwrap_or_default(),
                entry.last_accessed_at.sequence,
                entry.last_accessed_at.wall_clock.format(&rfc3339).unwrap_or_default(),
                entry.access_count as i64,
                encode_embedding(&entry.embedding),
            ],
        )
        .map_err(|e| AgentError::MemoryStorage(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, AgentError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM memory_entries WHERE id = ?1", params![id], row_to_entry)
            .optional()
            .map_err(|e| AgentError::MemoryStorage(e.to_string()))
    }

    async fn search_keyword(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, AgentError> {
        if query.trim().is_empty() {
            return self.list_recent(limit).await;
        }
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT memory_entries.* FROM memory_fts
                 JOIN memory_entries ON memory_entries.rowid = memory_fts.rowid
                 WHERE memory_fts MATCH ?1
                 ORDER BY bm25(memory_fts) LIMIT ?2",
            )
            .map_err(|e| AgentError::MemoryRetrieval(e.to_string()))?;
        let rows = stmt
            .query_map(params![fts_query(query), limit as i64], row_to_entry)
            .map_err(|e| AgentError::MemoryRetrieval(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| AgentError::MemoryRetrieval(e.to_string()))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<MemoryEntry>, AgentError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM memory_entries ORDER BY created_at_seq DESC LIMIT ?1")
            .map_err(|e| AgentError::MemoryRetrieval(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_entry)
            .map_err(|e| AgentError::MemoryRetrieval(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| AgentError::MemoryRetrieval(e.to_string()))
    }

    async fn record_access(&self, id: &str) -> Result<(), AgentError> {
        let conn = self.conn.lock().await;
        let now = Timestamp::now();
        let rfc3339 = time::format_description::well_known::Rfc3339;
        conn.execute(
            "UPDATE memory_entries SET access_count = access_count + 1,
                 last_accessed_seq = ?2, last_accessed_wall = ?3 WHERE id = ?1",
            params![id, now.sequence, now.wall_clock.format(&rfc3339).unwrap_or_default()],
        )
        .map_err(|e| AgentError::MemoryStorage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AgentError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM memory_entries WHERE id = ?1", params![id])
            .map_err(|e| AgentError::MemoryStorage(e.to_string()))?;
        Ok(())
    }

    async fn load_conversation(&self, id: &str) -> Result<Conversation, AgentError> {
        let conn = self.conn.lock().await;
        let rfc3339 = time::format_description::well_known::Rfc3339;
        let header: Option<(String, i64, String)> = conn
            .query_row(
                "SELECT title, created_at_seq, created_at_wall FROM conversations WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| AgentError::MemoryRetrieval(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT * FROM conversation_messages WHERE conversation_id = ?1 ORDER BY created_at_seq ASC",
            )
            .map_err(|e| AgentError::MemoryRetrieval(e.to_string()))?;
        let messages = stmt
            .query_map(params![id], row_to_message)
            .map_err(|e| AgentError::MemoryRetrieval(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AgentError::MemoryRetrieval(e.to_string()))?;

        let (title, created_at) = match header {
            Some((title, seq, wall)) => (
                title,
                Timestamp {
                    sequence: seq,
                    wall_clock: OffsetDateTime::parse(&wall, &rfc3339).unwrap_or(OffsetDateTime::UNIX_EPOCH),
                },
            ),
            None => (String::new(), Timestamp::now()),
        };

        Ok(Conversation { id: id.to_string(), messages, created_at, title })
    }

    async fn save_conversation(&self, id: &str, messages: &[Message], title: &str) -> Result<(), AgentError> {
        let mut conn = self.conn.lock().await;
        let rfc3339 = time::format_description::well_known::Rfc3339;
        let now = Timestamp::now();
        let tx = conn.transaction().map_err(|e| AgentError::MemoryStorage(e.to_string()))?;

        tx.execute(
            "INSERT INTO conversations (id, title, created_at_seq, created_at_wall)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title",
            params![id, title, now.sequence, now.wall_clock.format(&rfc3339).unwrap_or_default()],
        )
        .map_err(|e| AgentError::MemoryStorage(e.to_string()))?;

        for message in messages {
            let tool_calls_json = serde_json::to_string(&message.tool_calls).unwrap_or_else(|_| "[]".to_string());
            tx.execute(
                "INSERT OR IGNORE INTO conversation_messages
                    (conversation_id, message_id, role, content, tool_calls, tool_call_id,
                     created_at_seq, created_at_wall, token_estimate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    message.id,
                    role_str(message.role),
                    message.content,
                    tool_calls_json,
                    message.tool_call_id,
                    message.created_at.sequence,
                    message.created_at.wall_clock.format(&rfc3339).unwrap_or_default(),
                    message.token_estimate as i64,
                ],
            )
            .map_err(|e| AgentError::MemoryStorage(e.to_string()))?;
        }

        tx.commit().map_err(|e| AgentError::MemoryStorage(e.to_string()))?;
        Ok(())
    }
}

/// FTS5 treats bare punctuation as syntax; quote each term so keyword
/// content with apostrophes or hyphens doesn't throw a query parse error.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn keywords(words: &[&str]) -> HashSet<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = SqliteMemoryStore::open_in_memory().await.unwrap();
        let entry = MemoryEntry::new(MemoryKind::Interaction, "discussed the release plan", keywords(&["release", "plan"]), 0.6, None);
        store.insert(entry.clone()).await.unwrap();
        let fetched = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, entry.content);
        assert_eq!(fetched.keywords, entry.keywords);
    }

    #[tokio::test]
    async fn keyword_search_finds_matching_entries() {
        let store = SqliteMemoryStore::open_in_memory().await.unwrap();
        store
            .insert(MemoryEntry::new(MemoryKind::Interaction, "the deploy failed on staging", keywords(&["deploy", "staging"]), 0.5, None))
            .await
            .unwrap();
        store
            .insert(MemoryEntry::new(MemoryKind::Interaction, "lunch recommendations nearby", keywords(&["lunch"]), 0.2, None))
            .await
            .unwrap();

        let results = store.search_keyword("deploy", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("deploy"));
    }

    #[tokio::test]
    async fn record_access_increments_count_and_updates_timestamp() {
        let store = SqliteMemoryStore::open_in_memory().await.unwrap();
        let entry = MemoryEntry::new(MemoryKind::Insight, "user prefers terse replies", HashSet::new(), 0.8, None);
        store.insert(entry.clone()).await.unwrap();
        store.record_access(&entry.id).await.unwrap();
        let fetched = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.access_count, 1);
        assert!(fetched.last_accessed_at.sequence > entry.last_accessed_at.sequence);
    }

    #[tokio::test]
    async fn loading_an_unsaved_conversation_returns_an_empty_one() {
        let store = SqliteMemoryStore::open_in_memory().await.unwrap();
        let conversation = store.load_conversation("missing").await.unwrap();
        assert!(conversation.messages.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_messages_in_order() {
        let store = SqliteMemoryStore::open_in_memory().await.unwrap();
        let messages = vec![agentry_core::Message::user("hi", 1), agentry_core::Message::assistant("hello", vec![], 1)];
        store.save_conversation("c1", &messages, "greeting").await.unwrap();
        let loaded = store.load_conversation("c1").await.unwrap();
        assert_eq!(loaded.title, "greeting");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].content, "hi");
        assert_eq!(loaded.messages[1].content, "hello");
    }

    #[tokio::test]
    async fn save_conversation_append_is_idempotent_per_message_id() {
        let store = SqliteMemoryStore::open_in_memory().await.unwrap();
        let messages = vec![agentry_core::Message::user("hi", 1)];
        store.save_conversation("c1", &messages, "t").await.unwrap();
        store.save_conversation("c1", &messages, "t").await.unwrap();
        let loaded = store.load_conversation("c1").await.unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn save_conversation_appends_new_messages_without_duplicating_old_ones() {
        let store = SqliteMemoryStore::open_in_memory().await.unwrap();
        let first = vec![agentry_core::Message::user("hi", 1)];
        store.save_conversation("c1", &first, "t").await.unwrap();
        let second = vec![first[0].clone(), agentry_core::Message::assistant("hello", vec![], 1)];
        store.save_conversation("c1", &second, "t").await.unwrap();
        let loaded = store.load_conversation("c1").await.unwrap();
        assert_eq!(loaded.messages.len(), 2);
    }
}
