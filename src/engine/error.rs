//! Engine error taxonomy.
//!
//! Every storage or codec failure maps to exactly one of these kinds before
//! crossing the engine boundary; the API layer turns them into status codes.

use thiserror::Error;

use crate::storage::StorageError;

/// Typed token decode failures. Callers collapse most of these into
/// "try refresh" vs "must log in again".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    SignatureInvalid,

    #[error("token expired")]
    Expired,

    #[error("unknown signing key: {0}")]
    UnknownKey(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad request shape or fields; surfaced as 400.
    #[error("invalid input: {0}")]
    MalformedInput(String),

    /// Invalid, expired, or revoked session/token; surfaced as the configured
    /// session-expired status code.
    #[error("unauthorised: {0}")]
    Unauthorised(String),

    /// A superseded refresh token was replayed. The session has already been
    /// revoked by the time this error is returned.
    #[error("token theft detected for session {session_handle}")]
    TokenTheftDetected {
        session_handle: String,
        user_id: String,
    },

    /// Retryable storage failure; surfaced as 500.
    #[error("transient storage error: {0}")]
    TransientStorage(#[from] StorageError),

    /// Key rotation failed; fatal to the affected request only.
    #[error("signing key generation failed: {0}")]
    KeyGeneration(String),

    /// Token signing or secret generation failed; surfaced as 500.
    #[error("token signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Token(#[from] TokenError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_convert_to_transient() {
        let err = EngineError::from(StorageError::Timeout);
        assert!(matches!(err, EngineError::TransientStorage(_)));
    }

    #[test]
    fn token_errors_keep_their_kind() {
        let err = EngineError::from(TokenError::UnknownKey("kid".to_string()));
        assert!(matches!(
            err,
            EngineError::Token(TokenError::UnknownKey(kid)) if kid == "kid"
        ));
    }
}
