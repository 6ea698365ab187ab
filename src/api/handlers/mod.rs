pub mod health;
pub use self::health::health;

pub mod handshake;
pub use self::handshake::handshake;

pub mod session;
pub use self::session::{
    create_session, get_session_data, put_session_data, refresh_session, remove_session,
    verify_session,
};

// common functions for the handlers
use axum::http::StatusCode;
use tracing::error;

use crate::config::EngineConfig;
use crate::engine::EngineError;

/// Map engine errors to the wire. Authentication failures use the configured
/// session-expired status code so cookie-clearing clients can key off it.
pub fn error_response(err: &EngineError, config: &EngineConfig) -> (StatusCode, String) {
    match err {
        EngineError::MalformedInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        EngineError::Unauthorised(msg) => (session_expired_status(config), msg.clone()),
        EngineError::TokenTheftDetected { .. } => (
            session_expired_status(config),
            "token theft detected".to_string(),
        ),
        EngineError::Token(token_err) => (session_expired_status(config), token_err.to_string()),
        EngineError::TransientStorage(storage_err) => {
            error!("Storage error: {storage_err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            )
        }
        EngineError::KeyGeneration(msg) | EngineError::Signing(msg) => {
            error!("Signing error: {msg}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            )
        }
    }
}

fn session_expired_status(config: &EngineConfig) -> StatusCode {
    StatusCode::from_u16(config.session_expired_status_code())
        .unwrap_or(StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TokenError;
    use crate::storage::StorageError;

    #[test]
    fn malformed_input_is_bad_request() {
        let config = EngineConfig::default();
        let (status, body) =
            error_response(&EngineError::MalformedInput("bad".to_string()), &config);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "bad");
    }

    #[test]
    fn auth_failures_use_the_configured_status_code() {
        let config = EngineConfig::default();
        let (status, _) =
            error_response(&EngineError::Unauthorised("nope".to_string()), &config);
        assert_eq!(status.as_u16(), 440);

        let (status, _) = error_response(&EngineError::Token(TokenError::Expired), &config);
        assert_eq!(status.as_u16(), 440);

        let (status, _) = error_response(
            &EngineError::TokenTheftDetected {
                session_handle: "h".to_string(),
                user_id: "u".to_string(),
            },
            &config,
        );
        assert_eq!(status.as_u16(), 440);
    }

    #[test]
    fn custom_status_code_is_honoured() {
        let config = EngineConfig::default().with_session_expired_status_code(401);
        let (status, _) =
            error_response(&EngineError::Unauthorised("nope".to_string()), &config);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn invalid_status_code_falls_back_to_unauthorized() {
        let config = EngineConfig::default().with_session_expired_status_code(99);
        let (status, _) =
            error_response(&EngineError::Unauthorised("nope".to_string()), &config);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn storage_errors_do_not_leak_details() {
        let config = EngineConfig::default();
        let (status, body) = error_response(
            &EngineError::TransientStorage(StorageError::Query("secret dsn".to_string())),
            &config,
        );
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Internal Server Error");
    }
}
