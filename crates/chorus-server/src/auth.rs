use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use chorus_core::{AuthOutcome, Authenticator, Identity};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to sign token: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenUser {
    id: String,
    name: String,
    email: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    data: TokenUser,
    exp: i64,
    #[serde(default)]
    iat: i64,
}

/// HS256 access-token verifier sharing one secret with the login service.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sign a token for `identity` that expires at `expires_at` (Unix seconds).
    /// Used by tooling and tests; the chat server itself never issues tokens.
    pub fn issue(&self, identity: &Identity, expires_at: i64) -> Result<String, AuthError> {
        let claims = Claims {
            data: TokenUser {
                id: identity.user_id.clone(),
                name: identity.name.clone(),
                email: identity.email.clone(),
            },
            exp: expires_at,
            iat: Utc::now().timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    fn classify(&self, token: &str) -> AuthOutcome {
        if token.is_empty() {
            return AuthOutcome::Absent;
        }
        match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => AuthOutcome::Verified(Identity {
                user_id: data.claims.data.id,
                name: data.claims.data.name,
                email: data.claims.data.email,
            }),
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => AuthOutcome::Expired,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected token");
                AuthOutcome::Absent
            }
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn verify(&self, token: &str) -> AuthOutcome {
        self.classify(token)
    }
}
