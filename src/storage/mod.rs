//! Storage collaborator interface for sessions, signing keys, and the
//! access-token blacklist.
//!
//! The engine depends only on [`AuthStorage`]; one implementation exists per
//! backend. Private key material is wrapped in `SecretString` and must never
//! be serialized outward.

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// Storage failures the engine maps into its own taxonomy.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient query failure; the logical operation is safe to retry.
    #[error("storage query failed: {0}")]
    Query(String),

    /// Transaction conflict; the caller must retry the logical operation.
    #[error("storage transaction conflict")]
    Conflict,

    /// The caller-supplied timeout elapsed before the operation finished.
    #[error("storage operation timed out")]
    Timeout,
}

/// Persisted session record. Owned by storage; the engine holds no copy
/// beyond a single request's scope.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_handle: String,
    pub user_id: String,
    pub session_data: Value,
    pub jwt_user_payload: Value,
    pub refresh_token_version: i64,
    pub anti_csrf_token: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub expires_at: i64,
}

/// Persisted signing key. The private key never leaves the key manager.
#[derive(Debug, Clone)]
pub struct SigningKeyRecord {
    pub key_id: String,
    pub algorithm: String,
    pub public_key_pem: String,
    pub private_key_pem: SecretString,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub expires_at: i64,
}

/// Outcome of the compare-and-swap on a session's refresh token version.
#[derive(Debug)]
pub enum VersionCas {
    /// The version advanced from the expected value.
    Updated,
    /// Another writer advanced the version first.
    Stale { current_version: i64 },
    /// The session no longer exists.
    Missing,
}

/// Capability interface over the persistent store.
///
/// Implementations must make `save_signing_key` refuse to overwrite a newer
/// unexpired key (`StorageError::Conflict`) so that concurrent rotation from
/// multiple processes stays idempotent, and must make
/// `update_session_version` an atomic compare-and-swap so refreshes on the
/// same handle serialize.
#[async_trait]
pub trait AuthStorage: Send + Sync {
    async fn save_session(&self, session: &SessionRecord) -> Result<(), StorageError>;

    async fn get_session(&self, handle: &str) -> Result<Option<SessionRecord>, StorageError>;

    /// Atomically bump the refresh token version iff it still equals
    /// `expected_version`, installing the new anti-CSRF token and expiry in
    /// the same write.
    async fn update_session_version(
        &self,
        handle: &str,
        expected_version: i64,
        new_version: i64,
        anti_csrf_token: Option<&str>,
        expires_at: i64,
    ) -> Result<VersionCas, StorageError>;

    /// Replace the opaque session data blob. Returns `false` when the session
    /// does not exist.
    async fn update_session_data(&self, handle: &str, data: &Value) -> Result<bool, StorageError>;

    /// Returns `true` when a record was deleted.
    async fn delete_session(&self, handle: &str) -> Result<bool, StorageError>;

    /// Deletes every session of the user and returns the revoked handles.
    async fn delete_sessions_for_user(&self, user_id: &str)
        -> Result<Vec<String>, StorageError>;

    /// Storage-hygiene sweep; correctness never depends on it.
    async fn delete_expired_sessions(&self, now: i64) -> Result<u64, StorageError>;

    /// Persist a freshly generated key. Fails with `Conflict` when a newer
    /// unexpired key already exists (another process rotated first).
    async fn save_signing_key(&self, key: &SigningKeyRecord) -> Result<(), StorageError>;

    /// The newest persisted key, regardless of expiry.
    async fn get_current_signing_key(&self) -> Result<Option<SigningKeyRecord>, StorageError>;

    async fn get_signing_key_by_id(
        &self,
        key_id: &str,
    ) -> Result<Option<SigningKeyRecord>, StorageError>;

    async fn blacklist_token(&self, handle: &str) -> Result<(), StorageError>;

    async fn is_token_blacklisted(&self, handle: &str) -> Result<bool, StorageError>;
}
