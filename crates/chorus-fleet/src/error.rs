use std::time::Duration;

/// Failures talking to the shared fleet store.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("shared store timed out after {0:?}")]
    Timeout(Duration),

    #[error("value at {key} is not an integer: {detail}")]
    NotAnInteger { key: String, detail: String },

    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    #[error("subscription closed: {0}")]
    Closed(String),
}

impl FleetError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::Timeout(_) => "timeout",
            Self::NotAnInteger { .. } => "not_an_integer",
            Self::Unavailable(_) => "unavailable",
            Self::Closed(_) => "closed",
        }
    }
}
