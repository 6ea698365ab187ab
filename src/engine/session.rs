//! Session state machine: create, refresh, verify, revoke.
//!
//! Transitions: `Active -> Refreshed (self-loop) -> Revoked (terminal)`.
//! There is no expired state; expiry is evaluated lazily at verification and
//! refresh time against the stored `expires_at`, and expired records are
//! reaped when encountered. Refreshes on one handle serialize through the
//! storage compare-and-swap; operations on different handles never block
//! each other.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::EngineError;
use super::token::{AccessTokenClaims, RefreshTokenClaims};
use super::{millis, unix_ms, SessionEngine};
use crate::storage::{SessionRecord, VersionCas};

/// Read-only view of a verified or freshly written session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_handle: String,
    pub user_id: String,
    pub user_payload: Value,
    /// Unix milliseconds.
    pub expires_at: i64,
}

/// A signed token together with its expiry in unix milliseconds.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
    pub created_at: i64,
}

/// Result of `create_session` and `refresh_session`.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: SessionInfo,
    pub access_token: IssuedToken,
    pub refresh_token: IssuedToken,
    /// Present iff anti-CSRF is enabled.
    pub anti_csrf_token: Option<String>,
}

impl SessionEngine {
    /// Create a session for the user and issue the initial token pair.
    ///
    /// # Errors
    /// Storage and signing failures map to the engine taxonomy.
    pub async fn create_session(
        &self,
        user_id: &str,
        session_data: Value,
        jwt_payload: Value,
    ) -> Result<CreatedSession, EngineError> {
        if user_id.is_empty() {
            return Err(EngineError::MalformedInput("userId must not be empty".to_string()));
        }

        let now = unix_ms();
        let anti_csrf_token = if self.config.anti_csrf_enabled() {
            Some(generate_anti_csrf_token()?)
        } else {
            None
        };
        let record = SessionRecord {
            session_handle: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            session_data,
            jwt_user_payload: jwt_payload,
            refresh_token_version: 0,
            anti_csrf_token,
            created_at: now,
            expires_at: now.saturating_add(millis(self.config.refresh_token_validity())),
        };
        self.with_timeout(self.storage.save_session(&record)).await?;
        debug!(session_handle = %record.session_handle, user_id, "session created");

        self.issue_tokens(&record, now).await
    }

    /// Verify an access token. Side-effect free.
    ///
    /// # Errors
    /// `Unauthorised` for anti-CSRF or blacklist failures; token decode
    /// errors pass through typed.
    pub async fn verify_session(
        &self,
        access_token: &str,
        anti_csrf_token: Option<&str>,
    ) -> Result<SessionInfo, EngineError> {
        let claims = self.codec.decode_access(access_token).await?;

        if self.config.anti_csrf_enabled() {
            let presented = anti_csrf_token.ok_or_else(|| {
                EngineError::Unauthorised("anti-CSRF token missing".to_string())
            })?;
            let bound = claims.anti_csrf_token.as_deref().ok_or_else(|| {
                EngineError::Unauthorised("access token carries no anti-CSRF binding".to_string())
            })?;
            if bound != presented {
                return Err(EngineError::Unauthorised(
                    "anti-CSRF token mismatch".to_string(),
                ));
            }
        }

        if self.blacklist.is_blacklisted(&claims.session_handle).await? {
            return Err(EngineError::Unauthorised(
                "access token has been revoked".to_string(),
            ));
        }

        Ok(SessionInfo {
            session_handle: claims.session_handle,
            user_id: claims.user_id,
            user_payload: claims.user_payload,
            expires_at: claims.exp * 1000,
        })
    }

    /// Rotate the refresh token version and reissue both tokens.
    ///
    /// A version mismatch means a superseded refresh token is being replayed;
    /// the session is revoked immediately and the call fails with
    /// `TokenTheftDetected`. Concurrent refreshes on one handle serialize
    /// through the storage compare-and-swap: exactly one wins the N -> N+1
    /// increment, and a loser whose presented version is now stale gets the
    /// same theft treatment.
    ///
    /// # Errors
    /// `Unauthorised` when the session is gone or expired; theft and
    /// storage/codec errors as above.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<CreatedSession, EngineError> {
        let now = unix_ms();
        let claims = self.codec.decode_refresh(refresh_token).await?;

        let session = self
            .with_timeout(self.storage.get_session(&claims.session_handle))
            .await?
            .ok_or_else(|| EngineError::Unauthorised("session does not exist".to_string()))?;

        if session.expires_at <= now {
            // Lazy reap; hygiene only, the rejection below is what matters.
            let _ = self
                .with_timeout(self.storage.delete_session(&session.session_handle))
                .await;
            return Err(EngineError::Unauthorised("session expired".to_string()));
        }

        if claims.refresh_token_version != session.refresh_token_version {
            return Err(self.detect_token_theft(&session).await);
        }

        let anti_csrf_token = if self.config.anti_csrf_enabled() {
            Some(generate_anti_csrf_token()?)
        } else {
            None
        };
        let new_version = claims.refresh_token_version + 1;
        let new_expiry = now.saturating_add(millis(self.config.refresh_token_validity()));

        let cas = self
            .with_timeout(self.storage.update_session_version(
                &session.session_handle,
                claims.refresh_token_version,
                new_version,
                anti_csrf_token.as_deref(),
                new_expiry,
            ))
            .await?;

        match cas {
            VersionCas::Updated => {
                let record = SessionRecord {
                    refresh_token_version: new_version,
                    anti_csrf_token,
                    expires_at: new_expiry,
                    ..session
                };
                debug!(
                    session_handle = %record.session_handle,
                    version = new_version,
                    "session refreshed"
                );
                self.issue_tokens(&record, now).await
            }
            VersionCas::Stale { current_version } => {
                // Lost the race; the presented version is superseded now.
                debug!(
                    session_handle = %session.session_handle,
                    presented = claims.refresh_token_version,
                    current_version,
                    "concurrent refresh lost compare-and-swap"
                );
                Err(self.detect_token_theft(&session).await)
            }
            VersionCas::Missing => {
                Err(EngineError::Unauthorised("session does not exist".to_string()))
            }
        }
    }

    /// Revoke one session. Returns `true` when a record was deleted.
    ///
    /// # Errors
    /// Storage failures map to transient errors.
    pub async fn revoke_session(&self, handle: &str) -> Result<bool, EngineError> {
        // Blacklist before deleting so outstanding access tokens cannot pass
        // verification in between.
        self.blacklist.blacklist(handle).await?;
        let deleted = self.with_timeout(self.storage.delete_session(handle)).await?;
        if deleted {
            debug!(session_handle = %handle, "session revoked");
        }
        Ok(deleted)
    }

    /// Revoke every session of a user. Returns the revoked handles.
    ///
    /// # Errors
    /// Storage failures map to transient errors.
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<Vec<String>, EngineError> {
        let handles = self
            .with_timeout(self.storage.delete_sessions_for_user(user_id))
            .await?;
        for handle in &handles {
            self.blacklist.blacklist(handle).await?;
        }
        debug!(user_id, revoked = handles.len(), "user sessions revoked");
        Ok(handles)
    }

    /// Fetch the opaque session data blob.
    ///
    /// # Errors
    /// `Unauthorised` when the session does not exist.
    pub async fn get_session_data(&self, handle: &str) -> Result<Value, EngineError> {
        let session = self
            .with_timeout(self.storage.get_session(handle))
            .await?
            .ok_or_else(|| EngineError::Unauthorised("session does not exist".to_string()))?;
        Ok(session.session_data)
    }

    /// Replace the opaque session data blob.
    ///
    /// # Errors
    /// `Unauthorised` when the session does not exist.
    pub async fn update_session_data(&self, handle: &str, data: Value) -> Result<(), EngineError> {
        let updated = self
            .with_timeout(self.storage.update_session_data(handle, &data))
            .await?;
        if updated {
            Ok(())
        } else {
            Err(EngineError::Unauthorised("session does not exist".to_string()))
        }
    }

    async fn issue_tokens(
        &self,
        record: &SessionRecord,
        now: i64,
    ) -> Result<CreatedSession, EngineError> {
        let access_expires_at = now.saturating_add(millis(self.config.access_token_validity()));
        let access_claims = AccessTokenClaims {
            session_handle: record.session_handle.clone(),
            user_id: record.user_id.clone(),
            refresh_token_version: record.refresh_token_version,
            anti_csrf_token: record.anti_csrf_token.clone(),
            user_payload: record.jwt_user_payload.clone(),
            exp: access_expires_at / 1000,
            iat: now / 1000,
        };
        let refresh_claims = RefreshTokenClaims {
            session_handle: record.session_handle.clone(),
            refresh_token_version: record.refresh_token_version,
            exp: record.expires_at / 1000,
            iat: now / 1000,
        };

        let access_token = self.codec.sign_access(&access_claims).await?;
        let refresh_token = self.codec.sign_refresh(&refresh_claims).await?;

        Ok(CreatedSession {
            session: SessionInfo {
                session_handle: record.session_handle.clone(),
                user_id: record.user_id.clone(),
                user_payload: record.jwt_user_payload.clone(),
                expires_at: record.expires_at,
            },
            access_token: IssuedToken {
                token: access_token,
                expires_at: access_expires_at,
                created_at: now,
            },
            refresh_token: IssuedToken {
                token: refresh_token,
                expires_at: record.expires_at,
                created_at: now,
            },
            anti_csrf_token: record.anti_csrf_token.clone(),
        })
    }

    /// Revoke the session and build the theft error. Logged distinctly from
    /// ordinary unauthorised failures.
    async fn detect_token_theft(&self, session: &SessionRecord) -> EngineError {
        if let Err(err) = self.revoke_session(&session.session_handle).await {
            warn!(
                session_handle = %session.session_handle,
                "failed to revoke session after token theft: {err}"
            );
        }
        error!(
            session_handle = %session.session_handle,
            user_id = %session.user_id,
            "refresh token reuse detected, session revoked"
        );
        EngineError::TokenTheftDetected {
            session_handle: session.session_handle.clone(),
            user_id: session.user_id.clone(),
        }
    }
}

fn generate_anti_csrf_token() -> Result<String, EngineError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| EngineError::Signing(format!("failed to generate anti-CSRF token: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
