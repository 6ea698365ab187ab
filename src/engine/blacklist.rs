//! Access-token blacklist registry.
//!
//! Revoked sessions are tracked by session handle, the stable identifier
//! carried in every access token. When blacklisting is disabled both
//! operations are no-ops and verification stays storage-free.

use std::sync::Arc;
use std::time::Duration;

use crate::storage::{AuthStorage, StorageError};

pub struct BlacklistRegistry {
    storage: Arc<dyn AuthStorage>,
    enabled: bool,
    storage_timeout: Duration,
}

impl BlacklistRegistry {
    pub fn new(storage: Arc<dyn AuthStorage>, enabled: bool, storage_timeout: Duration) -> Self {
        Self {
            storage,
            enabled,
            storage_timeout,
        }
    }

    /// Record a revoked session handle. No-op while blacklisting is disabled.
    ///
    /// # Errors
    /// Returns a storage error if the write fails or times out.
    pub async fn blacklist(&self, handle: &str) -> Result<(), StorageError> {
        if !self.enabled {
            return Ok(());
        }
        self.with_timeout(self.storage.blacklist_token(handle)).await
    }

    /// Whether the handle was revoked. Always `false` (without touching
    /// storage) while blacklisting is disabled.
    ///
    /// # Errors
    /// Returns a storage error if the lookup fails or times out.
    pub async fn is_blacklisted(&self, handle: &str) -> Result<bool, StorageError> {
        if !self.enabled {
            return Ok(false);
        }
        self.with_timeout(self.storage.is_token_blacklisted(handle))
            .await
    }

    async fn with_timeout<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.storage_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn disabled_registry_never_reports_blacklisted() {
        let storage = Arc::new(MemoryStorage::new());
        storage.blacklist_token("h1").await.unwrap();

        let registry = BlacklistRegistry::new(storage, false, Duration::from_secs(1));
        assert!(!registry.is_blacklisted("h1").await.unwrap());
    }

    #[tokio::test]
    async fn enabled_registry_roundtrips() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = BlacklistRegistry::new(storage, true, Duration::from_secs(1));

        assert!(!registry.is_blacklisted("h1").await.unwrap());
        registry.blacklist("h1").await.unwrap();
        assert!(registry.is_blacklisted("h1").await.unwrap());
        assert!(!registry.is_blacklisted("h2").await.unwrap());
    }
}
