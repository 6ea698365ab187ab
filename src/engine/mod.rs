//! Session authentication engine: signing key lifecycle, session/token state
//! machine, token codec, and blacklist registry.
//!
//! The engine is an explicitly constructed, dependency-injected instance: it
//! owns no global state, holds only the in-memory signing key cache between
//! requests, and talks to the outside world through [`AuthStorage`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::storage::{AuthStorage, StorageError};

pub mod blacklist;
pub mod error;
pub mod keys;
pub mod session;
pub mod token;

pub use error::{EngineError, TokenError};
pub use session::{CreatedSession, IssuedToken, SessionInfo};

use blacklist::BlacklistRegistry;
use keys::{SigningKey, SigningKeyManager};
use token::TokenCodec;

pub(crate) fn unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub struct SessionEngine {
    config: EngineConfig,
    storage: Arc<dyn AuthStorage>,
    keys: Arc<SigningKeyManager>,
    codec: TokenCodec,
    blacklist: BlacklistRegistry,
}

impl SessionEngine {
    #[must_use]
    pub fn new(config: EngineConfig, storage: Arc<dyn AuthStorage>) -> Self {
        let keys = Arc::new(SigningKeyManager::new(Arc::clone(&storage), &config));
        let codec = TokenCodec::new(Arc::clone(&keys));
        let blacklist = BlacklistRegistry::new(
            Arc::clone(&storage),
            config.access_token_blacklisting_enabled(),
            config.storage_timeout(),
        );
        Self {
            config,
            storage,
            keys,
            codec,
            blacklist,
        }
    }

    /// Provision the signing key before the service accepts traffic.
    ///
    /// # Errors
    /// Returns an error when no key can be generated and persisted.
    pub async fn warm_up(&self) -> Result<(), EngineError> {
        self.keys.warm_up().await
    }

    /// Graceful shutdown: waits for an in-flight key rotation to complete.
    pub async fn shutdown(&self) {
        self.keys.drain().await;
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Atomic snapshot of the current signing key for the handshake response:
    /// the public key and the expiry always belong to the same key.
    ///
    /// # Errors
    /// Returns an error when no current key is available.
    pub async fn handshake_key(&self) -> Result<Arc<SigningKey>, EngineError> {
        self.keys.current_key().await
    }

    pub(crate) async fn with_timeout<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.config.storage_timeout(), operation).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout),
        }
    }
}
