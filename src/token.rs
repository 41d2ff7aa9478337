//! Manage json web tokens.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::AdminIdentity;

/// Default token lifetime: 8 hours, in seconds.
pub const EXPIRATION_TIME: u64 = 8 * 60 * 60;

/// Why a presented token was rejected.
///
/// Every variant surfaces to the caller as 401, never 500.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token malformed")]
    Malformed,
    #[error("token signature mismatch")]
    SignatureInvalid,
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: administrator username.
    pub sub: String,
    /// Administrator display name.
    pub name: String,
    /// Administrator role.
    pub role: String,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
    /// Identifies the instance that issued the JWT.
    pub iss: String,
}

/// Manage JWT tokens, signed with a server-held secret.
#[derive(Clone)]
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    name: String,
    ttl: u64,
}

impl TokenManager {
    /// Create a new [`TokenManager`] instance.
    pub fn new(secret: &[u8], name: &str, ttl: Option<u64>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            name: name.to_owned(),
            ttl: ttl.unwrap_or(EXPIRATION_TIME),
        }
    }

    /// Token lifetime in seconds.
    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    /// Create a new token asserting `identity`.
    pub fn create(
        &self,
        identity: &AdminIdentity,
    ) -> Result<String, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TokenError::Malformed)?
            .as_secs();

        let claims = Claims {
            sub: identity.username.clone(),
            name: identity.display_name.clone(),
            role: identity.role.clone(),
            iat: now,
            exp: now + self.ttl,
            iss: self.name.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| TokenError::Malformed)
    }

    /// Decode and check a token.
    ///
    /// Rejects a signature that does not match the exact claim set, and an
    /// expired token even with a valid signature. No leeway, no renewal.
    pub fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(err) => Err(match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
                _ => TokenError::Malformed,
            }),
        }
    }
}
