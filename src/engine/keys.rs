//! Signing key store and rotation manager.
//!
//! Keeps the current key cached in memory behind a shared-read lock so the
//! request path never pays a storage round trip for signing. Rotation runs in
//! an exclusive critical section (detect expiry, generate, persist, publish)
//! with a double-check so a burst of requests observing an expired key
//! produces exactly one generation event. A key is never served as current
//! before it is durably persisted.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::error::{EngineError, TokenError};
use crate::engine::{millis, unix_ms};
use crate::storage::{AuthStorage, SigningKeyRecord, StorageError};

const SIGNING_ALGORITHM: &str = "RS256";
const RSA_KEY_BITS: usize = 2048;

/// A usable signing key: public metadata plus the prepared JWT key material.
/// The private key never leaves this type.
pub struct SigningKey {
    pub key_id: String,
    pub algorithm: String,
    pub public_key_pem: String,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub expires_at: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SigningKey {
    fn from_record(record: &SigningKeyRecord) -> Result<Self, EngineError> {
        let encoding_key =
            EncodingKey::from_rsa_pem(record.private_key_pem.expose_secret().as_bytes())
                .map_err(|err| {
                    EngineError::KeyGeneration(format!("invalid private key pem: {err}"))
                })?;
        let decoding_key = DecodingKey::from_rsa_pem(record.public_key_pem.as_bytes())
            .map_err(|err| EngineError::KeyGeneration(format!("invalid public key pem: {err}")))?;
        Ok(Self {
            key_id: record.key_id.clone(),
            algorithm: record.algorithm.clone(),
            public_key_pem: record.public_key_pem.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            encoding_key,
            decoding_key,
        })
    }

    /// Generate a fresh RSA key pair and its persistable record.
    pub(crate) fn generate(
        now: i64,
        validity_ms: i64,
    ) -> Result<(Self, SigningKeyRecord), EngineError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|err| EngineError::KeyGeneration(err.to_string()))?;
        let public_key = private_key.to_public_key();

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| EngineError::KeyGeneration(err.to_string()))?;
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| EngineError::KeyGeneration(err.to_string()))?;

        let record = SigningKeyRecord {
            key_id: Uuid::new_v4().to_string(),
            algorithm: SIGNING_ALGORITHM.to_string(),
            public_key_pem: public_pem,
            private_key_pem: SecretString::from(private_pem.to_string()),
            created_at: now,
            expires_at: now.saturating_add(validity_ms),
        };
        let key = Self::from_record(&record)?;
        Ok((key, record))
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

struct CachedKeys {
    current: Arc<SigningKey>,
    /// Keys past their nominal expiry, retained only to verify tokens signed
    /// before rotation, until their grace period elapses.
    retired: Vec<Arc<SigningKey>>,
}

pub struct SigningKeyManager {
    storage: Arc<dyn AuthStorage>,
    validity_ms: i64,
    grace_ms: i64,
    storage_timeout: Duration,
    cache: RwLock<Option<CachedKeys>>,
}

impl SigningKeyManager {
    pub fn new(storage: Arc<dyn AuthStorage>, config: &EngineConfig) -> Self {
        Self {
            storage,
            validity_ms: millis(config.signing_key_validity()),
            grace_ms: millis(config.signing_key_grace()),
            storage_timeout: config.storage_timeout(),
            cache: RwLock::new(None),
        }
    }

    /// Ensure a current key exists. Called before the service accepts
    /// traffic so a handshake never observes an empty key store.
    ///
    /// # Errors
    /// Returns an error if no key can be generated and persisted.
    pub async fn warm_up(&self) -> Result<(), EngineError> {
        self.current_key().await.map(|_| ())
    }

    /// The key used for new signatures, rotating first if it expired.
    ///
    /// # Errors
    /// Returns an error if rotation fails and no last-known key exists.
    pub async fn current_key(&self) -> Result<Arc<SigningKey>, EngineError> {
        let now = unix_ms();
        {
            let cache = self.cache.read().await;
            if let Some(keys) = cache.as_ref() {
                if now < keys.current.expires_at {
                    return Ok(Arc::clone(&keys.current));
                }
            }
        }
        self.rotate(now).await
    }

    /// Resolve a key for signature verification by id: the current key, a
    /// retired key within its grace period, or a key persisted by another
    /// process.
    ///
    /// # Errors
    /// Returns `TokenError::UnknownKey` when the key is absent or its grace
    /// period elapsed.
    pub async fn verification_key(&self, key_id: &str) -> Result<Arc<SigningKey>, EngineError> {
        let now = unix_ms();
        {
            let cache = self.cache.read().await;
            if let Some(keys) = cache.as_ref() {
                if keys.current.key_id == key_id && self.within_grace(&keys.current, now) {
                    return Ok(Arc::clone(&keys.current));
                }
                if let Some(old) = keys.retired.iter().find(|key| key.key_id == key_id) {
                    if self.within_grace(old, now) {
                        return Ok(Arc::clone(old));
                    }
                    return Err(TokenError::UnknownKey(key_id.to_string()).into());
                }
            }
        }

        // Not cached: either this process restarted or another process signed
        // with a key we have not seen yet.
        match self
            .with_timeout(self.storage.get_signing_key_by_id(key_id))
            .await?
        {
            Some(record) if now < record.expires_at.saturating_add(self.grace_ms) => {
                Ok(Arc::new(SigningKey::from_record(&record)?))
            }
            _ => Err(TokenError::UnknownKey(key_id.to_string()).into()),
        }
    }

    /// Wait for an in-flight rotation to finish; used during shutdown.
    pub async fn drain(&self) {
        drop(self.cache.write().await);
    }

    fn within_grace(&self, key: &SigningKey, now: i64) -> bool {
        now < key.expires_at.saturating_add(self.grace_ms)
    }

    async fn rotate(&self, now: i64) -> Result<Arc<SigningKey>, EngineError> {
        let mut cache = self.cache.write().await;
        // Double-check: a concurrent caller may have rotated while this one
        // waited for the write lock.
        if let Some(keys) = cache.as_ref() {
            if now < keys.current.expires_at {
                return Ok(Arc::clone(&keys.current));
            }
        }

        match self.adopt_or_generate(now).await {
            Ok(key) => {
                Self::publish(&mut cache, Arc::clone(&key), self.grace_ms, now);
                Ok(key)
            }
            Err(err) => match cache.as_ref() {
                // Rotation failure is fatal to the rotation only; keep
                // serving the last-known key until the next attempt.
                Some(keys) => {
                    warn!(
                        key_id = %keys.current.key_id,
                        "signing key rotation failed, serving last-known key: {err}"
                    );
                    Ok(Arc::clone(&keys.current))
                }
                None => Err(err),
            },
        }
    }

    async fn adopt_or_generate(&self, now: i64) -> Result<Arc<SigningKey>, EngineError> {
        // Another process sharing the store may have rotated already.
        if let Some(record) = self
            .with_timeout(self.storage.get_current_signing_key())
            .await?
        {
            if now < record.expires_at {
                debug!(key_id = %record.key_id, "adopting signing key persisted by another process");
                return Ok(Arc::new(SigningKey::from_record(&record)?));
            }
        }

        let (key, record) = SigningKey::generate(now, self.validity_ms)?;
        match self.with_timeout(self.storage.save_signing_key(&record)).await {
            Ok(()) => {
                info!(key_id = %key.key_id, expires_at = key.expires_at, "generated new signing key");
                Ok(Arc::new(key))
            }
            Err(StorageError::Conflict) => {
                // Lost the persist race; adopt the winner's key.
                let record = self
                    .with_timeout(self.storage.get_current_signing_key())
                    .await?
                    .ok_or_else(|| {
                        EngineError::KeyGeneration(
                            "signing key insert conflicted but no key is persisted".to_string(),
                        )
                    })?;
                debug!(key_id = %record.key_id, "adopting signing key after persist conflict");
                Ok(Arc::new(SigningKey::from_record(&record)?))
            }
            // An unpersisted key must never be served as current.
            Err(err) => Err(EngineError::TransientStorage(err)),
        }
    }

    fn publish(cache: &mut Option<CachedKeys>, key: Arc<SigningKey>, grace_ms: i64, now: i64) {
        let mut retired = match cache.take() {
            Some(keys) => {
                let mut retired = keys.retired;
                if keys.current.key_id != key.key_id {
                    retired.push(keys.current);
                }
                retired
            }
            None => Vec::new(),
        };
        retired.retain(|old| now < old.expires_at.saturating_add(grace_ms));
        *cache = Some(CachedKeys { current: key, retired });
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
    use crate::storage::{MemoryStorage, SessionRecord, VersionCas};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn config(validity: Duration, grace: Duration) -> EngineConfig {
        EngineConfig::new()
            .with_signing_key_validity(validity)
            .with_signing_key_grace(grace)
    }

    fn manager(storage: Arc<dyn AuthStorage>, validity: Duration, grace: Duration) -> SigningKeyManager {
        SigningKeyManager::new(storage, &config(validity, grace))
    }

    #[tokio::test]
    async fn cold_start_generates_and_persists_a_key() {
        let storage = Arc::new(MemoryStorage::new());
        let keys = manager(storage.clone(), Duration::from_secs(3600), Duration::from_secs(60));

        keys.warm_up().await.unwrap();
        let current = keys.current_key().await.unwrap();

        let persisted = storage.get_current_signing_key().await.unwrap().unwrap();
        assert_eq!(persisted.key_id, current.key_id);
        assert_eq!(persisted.algorithm, "RS256");
        assert!(current.expires_at > current.created_at);
    }

    #[tokio::test]
    async fn current_key_is_stable_before_expiry() {
        let storage = Arc::new(MemoryStorage::new());
        let keys = manager(storage, Duration::from_secs(3600), Duration::from_secs(60));

        let first = keys.current_key().await.unwrap();
        let second = keys.current_key().await.unwrap();
        assert_eq!(first.key_id, second.key_id);
    }

    #[tokio::test]
    async fn rotation_after_expiry_produces_a_different_key() {
        let storage = Arc::new(MemoryStorage::new());
        let keys = manager(storage.clone(), Duration::from_millis(50), Duration::from_secs(60));

        let first = keys.current_key().await.unwrap();
        sleep(Duration::from_millis(80)).await;
        let second = keys.current_key().await.unwrap();

        assert_ne!(first.key_id, second.key_id);
        let persisted = storage.get_current_signing_key().await.unwrap().unwrap();
        assert_eq!(persisted.key_id, second.key_id);
    }

    #[tokio::test]
    async fn retired_key_verifies_within_grace_then_becomes_unknown() {
        let storage = Arc::new(MemoryStorage::new());
        let keys = manager(storage.clone(), Duration::from_millis(50), Duration::from_secs(3600));

        let old = keys.current_key().await.unwrap();
        sleep(Duration::from_millis(80)).await;
        let fresh = keys.current_key().await.unwrap();
        assert_ne!(old.key_id, fresh.key_id);

        // Within grace the retired key still resolves for verification.
        let resolved = keys.verification_key(&old.key_id).await.unwrap();
        assert_eq!(resolved.key_id, old.key_id);

        // A zero-grace manager over the same store treats it as unknown.
        let strict = manager(storage, Duration::from_millis(50), Duration::ZERO);
        let result = strict.verification_key(&old.key_id).await;
        assert!(matches!(
            result,
            Err(EngineError::Token(TokenError::UnknownKey(kid))) if kid == old.key_id
        ));
    }

    #[tokio::test]
    async fn unknown_key_id_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let keys = manager(storage, Duration::from_secs(3600), Duration::from_secs(60));
        keys.warm_up().await.unwrap();

        let result = keys.verification_key("no-such-key").await;
        assert!(matches!(
            result,
            Err(EngineError::Token(TokenError::UnknownKey(_)))
        ));
    }

    #[tokio::test]
    async fn existing_persisted_key_is_adopted_on_cold_start() {
        let storage = Arc::new(MemoryStorage::new());
        let now = unix_ms();
        let (_, record) = SigningKey::generate(now, 3_600_000).unwrap();
        storage.save_signing_key(&record).await.unwrap();

        let keys = manager(storage.clone(), Duration::from_secs(3600), Duration::from_secs(60));
        let current = keys.current_key().await.unwrap();

        assert_eq!(current.key_id, record.key_id);
        assert_eq!(storage.signing_key_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_rotation_generates_one_key() {
        let storage = Arc::new(MemoryStorage::new());
        let keys = Arc::new(manager(
            storage.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        ));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let keys = Arc::clone(&keys);
            tasks.push(tokio::spawn(async move {
                keys.current_key().await.map(|key| key.key_id.clone())
            }));
        }

        let mut key_ids = Vec::new();
        for task in tasks {
            key_ids.push(task.await.unwrap().unwrap());
        }
        key_ids.dedup();
        assert_eq!(key_ids.len(), 1);
        assert_eq!(storage.signing_key_count().await, 1);
    }

    /// Delegates to a `MemoryStorage` but fails every signing-key operation
    /// while the flag is set.
    struct FlakyKeyStorage {
        inner: MemoryStorage,
        fail_keys: AtomicBool,
    }

    impl FlakyKeyStorage {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                fail_keys: AtomicBool::new(false),
            }
        }

        fn key_result<T>(&self, ok: T) -> Result<T, StorageError> {
            if self.fail_keys.load(Ordering::SeqCst) {
                Err(StorageError::Query("injected failure".to_string()))
            } else {
                Ok(ok)
            }
        }
    }

    #[async_trait]
    impl AuthStorage for FlakyKeyStorage {
        async fn save_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
            self.inner.save_session(session).await
        }

        async fn get_session(&self, handle: &str) -> Result<Option<SessionRecord>, StorageError> {
            self.inner.get_session(handle).await
        }

        async fn update_session_version(
            &self,
            handle: &str,
            expected_version: i64,
            new_version: i64,
            anti_csrf_token: Option<&str>,
            expires_at: i64,
        ) -> Result<VersionCas, StorageError> {
            self.inner
                .update_session_version(handle, expected_version, new_version, anti_csrf_token, expires_at)
                .await
        }

        async fn update_session_data(
            &self,
            handle: &str,
            data: &Value,
        ) -> Result<bool, StorageError> {
            self.inner.update_session_data(handle, data).await
        }

        async fn delete_session(&self, handle: &str) -> Result<bool, StorageError> {
            self.inner.delete_session(handle).await
        }

        async fn delete_sessions_for_user(
            &self,
            user_id: &str,
        ) -> Result<Vec<String>, StorageError> {
            self.inner.delete_sessions_for_user(user_id).await
        }

        async fn delete_expired_sessions(&self, now: i64) -> Result<u64, StorageError> {
            self.inner.delete_expired_sessions(now).await
        }

        async fn save_signing_key(&self, key: &SigningKeyRecord) -> Result<(), StorageError> {
            self.key_result(())?;
            self.inner.save_signing_key(key).await
        }

        async fn get_current_signing_key(
            &self,
        ) -> Result<Option<SigningKeyRecord>, StorageError> {
            self.key_result(())?;
            self.inner.get_current_signing_key().await
        }

        async fn get_signing_key_by_id(
            &self,
            key_id: &str,
        ) -> Result<Option<SigningKeyRecord>, StorageError> {
            self.key_result(())?;
            self.inner.get_signing_key_by_id(key_id).await
        }

        async fn blacklist_token(&self, handle: &str) -> Result<(), StorageError> {
            self.inner.blacklist_token(handle).await
        }

        async fn is_token_blacklisted(&self, handle: &str) -> Result<bool, StorageError> {
            self.inner.is_token_blacklisted(handle).await
        }
    }

    #[tokio::test]
    async fn persist_failure_on_cold_start_is_transient() {
        let storage = Arc::new(FlakyKeyStorage::new());
        storage.fail_keys.store(true, Ordering::SeqCst);
        let keys = manager(storage, Duration::from_secs(3600), Duration::from_secs(60));

        let result = keys.current_key().await;
        assert!(matches!(result, Err(EngineError::TransientStorage(_))));
    }

    #[tokio::test]
    async fn rotation_failure_serves_last_known_key() {
        let storage = Arc::new(FlakyKeyStorage::new());
        let keys = manager(storage.clone(), Duration::from_millis(50), Duration::from_secs(60));

        let first = keys.current_key().await.unwrap();
        storage.fail_keys.store(true, Ordering::SeqCst);
        sleep(Duration::from_millis(80)).await;

        // Rotation cannot persist a new key, so the expired-but-known key
        // keeps serving rather than failing the request.
        let fallback = keys.current_key().await.unwrap();
        assert_eq!(fallback.key_id, first.key_id);

        // Once storage recovers, the next access rotates for real.
        storage.fail_keys.store(false, Ordering::SeqCst);
        let rotated = keys.current_key().await.unwrap();
        assert_ne!(rotated.key_id, first.key_id);
    }
}
