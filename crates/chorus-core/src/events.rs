use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// A chat message as it travels over the fan-out bus and out to clients.
/// Immutable once published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub id: MessageId,
    pub subject: String,
    pub message: String,
    pub name: String,
    pub email: String,
    /// Unix timestamp in nanoseconds.
    pub ts: i64,
}

/// A chat message before the history store has assigned it an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewChat {
    pub subject: String,
    pub message: String,
    pub name: String,
    pub email: String,
    pub ts: i64,
}

impl NewChat {
    /// Stamp a new chat with the current wall-clock time.
    pub fn now(
        subject: impl Into<String>,
        message: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
            name: name.into(),
            email: email.into(),
            ts: now_nanos(),
        }
    }

    pub fn with_id(self, id: MessageId) -> ChatEvent {
        ChatEvent {
            id,
            subject: self.subject,
            message: self.message,
            name: self.name,
            email: self.email,
            ts: self.ts,
        }
    }
}

/// Fleet-wide presence counts, derived from the shared store at publish time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    /// Distinct signed-in users, not sessions.
    pub authorized_users: i64,
    /// Unauthenticated connections.
    pub anonymous_users: i64,
}

/// Current time as Unix nanoseconds.
pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
