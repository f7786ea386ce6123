use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Who a connection is, once an auth handshake succeeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

/// Result of verifying a client-supplied credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credential is valid and fresh.
    Verified(Identity),
    /// Credential was valid but has expired; the client should refresh it.
    Expired,
    /// No usable credential. Deliberately indistinguishable from garbage.
    Absent,
}

/// Credential verification collaborator.
///
/// Implementations must never fail loudly: every problem maps to
/// [`AuthOutcome::Absent`] unless it is specifically an expiry.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> AuthOutcome;
}
