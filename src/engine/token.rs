//! Access and refresh token codec.
//!
//! Both token kinds are RS256-signed JWTs carrying the signing key id in the
//! header. Decoding verifies structure, signature (with grace-period fallback
//! to retired keys), and expiry, and reports each failure as a distinct
//! [`TokenError`] kind.

use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::engine::error::{EngineError, TokenError};
use crate::engine::keys::{SigningKey, SigningKeyManager};

/// Claims embedded in an access token. Immutable once issued; a refresh
/// produces a new token bound to the next refresh token version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenClaims {
    pub session_handle: String,
    pub user_id: String,
    pub refresh_token_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,
    pub user_payload: Value,
    /// Unix seconds.
    pub exp: i64,
    /// Unix seconds.
    pub iat: i64,
}

/// Claims embedded in a refresh token; opaque to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenClaims {
    pub session_handle: String,
    pub refresh_token_version: i64,
    /// Unix seconds.
    pub exp: i64,
    /// Unix seconds.
    pub iat: i64,
}

pub struct TokenCodec {
    keys: Arc<SigningKeyManager>,
}

impl TokenCodec {
    pub fn new(keys: Arc<SigningKeyManager>) -> Self {
        Self { keys }
    }

    /// Sign access token claims with the current key.
    ///
    /// # Errors
    /// Returns an error if no signing key is available or signing fails.
    pub async fn sign_access(&self, claims: &AccessTokenClaims) -> Result<String, EngineError> {
        let key = self.keys.current_key().await?;
        sign(&key, claims)
    }

    /// Sign refresh token claims with the current key.
    ///
    /// # Errors
    /// Returns an error if no signing key is available or signing fails.
    pub async fn sign_refresh(&self, claims: &RefreshTokenClaims) -> Result<String, EngineError> {
        let key = self.keys.current_key().await?;
        sign(&key, claims)
    }

    /// Decode and verify an access token.
    ///
    /// # Errors
    /// `TokenError` for malformed/invalid/expired tokens and unknown keys;
    /// transient storage errors while resolving a key pass through.
    pub async fn decode_access(&self, token: &str) -> Result<AccessTokenClaims, EngineError> {
        self.decode(token).await
    }

    /// Decode and verify a refresh token.
    ///
    /// # Errors
    /// Same contract as [`Self::decode_access`].
    pub async fn decode_refresh(&self, token: &str) -> Result<RefreshTokenClaims, EngineError> {
        self.decode(token).await
    }

    async fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, EngineError> {
        let header = decode_header(token).map_err(map_decode_error)?;
        let key_id = header.kid.ok_or(TokenError::Malformed)?;
        let key = self.keys.verification_key(&key_id).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        let data = decode::<T>(token, key.decoding_key(), &validation).map_err(map_decode_error)?;
        Ok(data.claims)
    }
}

fn sign<T: Serialize>(key: &SigningKey, claims: &T) -> Result<String, EngineError> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key.key_id.clone());
    encode(&header, claims, key.encoding_key())
        .map_err(|err| EngineError::Signing(err.to_string()))
}

fn map_decode_error(err: jsonwebtoken::errors::Error) -> EngineError {
    use jsonwebtoken::errors::ErrorKind;

    let kind = match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
        _ => TokenError::Malformed,
    };
    EngineError::Token(kind)
}
