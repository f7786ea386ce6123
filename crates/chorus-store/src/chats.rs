use async_trait::async_trait;
use tracing::instrument;

use chorus_core::history::PAGE_LIMIT;
use chorus_core::ids::MessageId;
use chorus_core::{ChatEvent, ChatHistory, HistoryError, NewChat};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable chat history backed by the `messages` table.
#[derive(Clone)]
pub struct ChatRepo {
    db: Database,
}

impl ChatRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a chat and return it with a freshly minted id.
    #[instrument(skip(self, chat), fields(ts = chat.ts))]
    pub fn insert(&self, chat: NewChat) -> Result<ChatEvent, StoreError> {
        let id = MessageId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, subject, message, name, email, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    chat.subject,
                    chat.message,
                    chat.name,
                    chat.email,
                    chat.ts,
                ],
            )?;
            Ok(())
        })?;
        Ok(chat.with_id(id))
    }

    /// At most `limit` messages with `ts < before_ts`, newest first.
    #[instrument(skip(self))]
    pub fn page_before(&self, before_ts: i64, limit: u32) -> Result<Vec<ChatEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, subject, message, name, email, ts
                 FROM messages WHERE ts < ?1
                 ORDER BY ts DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![before_ts, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_chat(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
                .map_err(StoreError::from)
        })
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> Result<ChatEvent, StoreError> {
    let id: String = row_helpers::get(row, 0, "messages", "id")?;
    Ok(ChatEvent {
        id: MessageId::from_raw(id),
        subject: row_helpers::get(row, 1, "messages", "subject")?,
        message: row_helpers::get(row, 2, "messages", "message")?,
        name: row_helpers::get(row, 3, "messages", "name")?,
        email: row_helpers::get(row, 4, "messages", "email")?,
        ts: row_helpers::get(row, 5, "messages", "ts")?,
    })
}

#[async_trait]
impl ChatHistory for ChatRepo {
    async fn persist_chat(&self, chat: NewChat) -> Result<ChatEvent, HistoryError> {
        let repo = self.clone();
        tokio::task::spawn_blocking(move || repo.insert(chat))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
            .map_err(HistoryError::from)
    }

    async fn page_messages(&self, before_ts: i64) -> Result<Vec<ChatEvent>, HistoryError> {
        let repo = self.clone();
        tokio::task::spawn_blocking(move || repo.page_before(before_ts, PAGE_LIMIT))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
            .map_err(HistoryError::from)
    }
}
