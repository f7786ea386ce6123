use std::time::Duration;

/// Failures surfaced by the chat history collaborator.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),
    #[error("history store corrupt: {0}")]
    Corrupt(String),
    #[error("history store timed out after {0:?}")]
    Timeout(Duration),
}

impl HistoryError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Corrupt(_) => "corrupt",
            Self::Timeout(_) => "timeout",
        }
    }
}
