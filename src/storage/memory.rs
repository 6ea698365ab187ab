//! In-memory storage backend for tests and local development.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{AuthStorage, SessionRecord, SigningKeyRecord, StorageError, VersionCas};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    keys: Vec<SigningKeyRecord>,
    blacklist: HashSet<String>,
}

/// Single-process backend. The mutex gives the same linearization the SQL
/// backend gets from its transactions.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted signing keys, for tests that assert rotation
    /// generated exactly one key.
    pub async fn signing_key_count(&self) -> usize {
        self.inner.lock().await.keys.len()
    }
}

#[async_trait]
impl AuthStorage for MemoryStorage {
    async fn save_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner
            .sessions
            .insert(session.session_handle.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, handle: &str) -> Result<Option<SessionRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.sessions.get(handle).cloned())
    }

    async fn update_session_version(
        &self,
        handle: &str,
        expected_version: i64,
        new_version: i64,
        anti_csrf_token: Option<&str>,
        expires_at: i64,
    ) -> Result<VersionCas, StorageError> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(handle) else {
            return Ok(VersionCas::Missing);
        };
        if session.refresh_token_version != expected_version {
            return Ok(VersionCas::Stale {
                current_version: session.refresh_token_version,
            });
        }
        session.refresh_token_version = new_version;
        session.anti_csrf_token = anti_csrf_token.map(str::to_string);
        session.expires_at = expires_at;
        Ok(VersionCas::Updated)
    }

    async fn update_session_data(&self, handle: &str, data: &Value) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(handle) {
            Some(session) => {
                session.session_data = data.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, handle: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.sessions.remove(handle).is_some())
    }

    async fn delete_sessions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        let mut inner = self.inner.lock().await;
        let handles: Vec<String> = inner
            .sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .map(|session| session.session_handle.clone())
            .collect();
        for handle in &handles {
            inner.sessions.remove(handle);
        }
        Ok(handles)
    }

    async fn delete_expired_sessions(&self, now: i64) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, session| session.expires_at > now);
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn save_signing_key(&self, key: &SigningKeyRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let newer_live_key = inner
            .keys
            .iter()
            .any(|existing| existing.expires_at > key.created_at);
        if newer_live_key {
            return Err(StorageError::Conflict);
        }
        inner.keys.push(key.clone());
        Ok(())
    }

    async fn get_current_signing_key(&self) -> Result<Option<SigningKeyRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .keys
            .iter()
            .max_by_key(|key| key.created_at)
            .cloned())
    }

    async fn get_signing_key_by_id(
        &self,
        key_id: &str,
    ) -> Result<Option<SigningKeyRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.keys.iter().find(|key| key.key_id == key_id).cloned())
    }

    async fn blacklist_token(&self, handle: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.blacklist.insert(handle.to_string());
        Ok(())
    }

    async fn is_token_blacklisted(&self, handle: &str) -> Result<bool, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.blacklist.contains(handle))
    }
}
