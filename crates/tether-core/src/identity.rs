use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token required")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("token carries no stable identifier")]
    MissingStableIdentifier,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Caller-chosen identifier bag.
    ids: serde_json::Map<String, Value>,
    iat: usize,
    exp: usize,
}

/// A verified credential: the full identifier bag plus the normalized
/// stable identifier the presence directory indexes on.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub identifiers: serde_json::Map<String, Value>,
    pub stable_id: String,
}

/// Issues and verifies the signed identity tokens that substitute for a
/// login session. Signature and shape are checked on every connection and
/// on every privileged call.
pub struct IdentityService {
    secret: String,
    expiry_seconds: u64,
    stable_key: String,
}

impl IdentityService {
    pub fn new(secret: String, expiry_seconds: u64, stable_key: String) -> Self {
        Self {
            secret,
            expiry_seconds,
            stable_key,
        }
    }

    pub fn stable_key(&self) -> &str {
        &self.stable_key
    }

    pub fn issue(&self, identifiers: serde_json::Map<String, Value>) -> Result<String, AuthError> {
        if normalize_identifier(identifiers.get(&self.stable_key)).is_none() {
            return Err(AuthError::MissingStableIdentifier);
        }
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = Claims {
            ids: identifiers,
            iat: now,
            exp: now + self.expiry_seconds as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })?;

        let stable_id = normalize_identifier(data.claims.ids.get(&self.stable_key))
            .ok_or(AuthError::MissingStableIdentifier)?;
        Ok(VerifiedIdentity {
            identifiers: data.claims.ids,
            stable_id,
        })
    }
}

fn normalize_identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
