use async_trait::async_trait;

use crate::errors::HistoryError;
use crate::events::{ChatEvent, NewChat};

/// Maximum number of messages returned by one history page.
pub const PAGE_LIMIT: u32 = 50;

/// Durable chat history collaborator.
#[async_trait]
pub trait ChatHistory: Send + Sync {
    /// Durably write a chat and return it with its store-assigned id.
    async fn persist_chat(&self, chat: NewChat) -> Result<ChatEvent, HistoryError>;

    /// Up to [`PAGE_LIMIT`] messages strictly older than `before_ts`, newest first.
    async fn page_messages(&self, before_ts: i64) -> Result<Vec<ChatEvent>, HistoryError>;
}
