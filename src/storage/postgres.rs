//! PostgreSQL storage backend.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{info_span, Instrument};

use super::{AuthStorage, SessionRecord, SigningKeyRecord, StorageError, VersionCas};

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS sessions (
        session_handle TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        session_data JSONB NOT NULL DEFAULT '{}'::jsonb,
        jwt_user_payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        refresh_token_version BIGINT NOT NULL DEFAULT 0,
        anti_csrf_token TEXT,
        created_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS sessions_user_id_idx ON sessions (user_id)",
    r"CREATE TABLE IF NOT EXISTS signing_keys (
        key_id TEXT PRIMARY KEY,
        algorithm TEXT NOT NULL,
        public_key TEXT NOT NULL,
        private_key TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS token_blacklist (
        session_handle TEXT PRIMARY KEY,
        blacklisted_at BIGINT NOT NULL
    )",
];

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the storage schema. Idempotent; run once at startup before the
    /// engine warms up.
    ///
    /// # Errors
    /// Returns an error if a DDL statement fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        // serialization_failure / deadlock_detected: the logical operation
        // must be retried by the caller
        if db_err
            .code()
            .is_some_and(|code| code.as_ref() == "40001" || code.as_ref() == "40P01")
        {
            return StorageError::Conflict;
        }
    }
    StorageError::Query(err.to_string())
}

fn session_from_row(row: &PgRow) -> Result<SessionRecord, StorageError> {
    let read = |err: sqlx::Error| StorageError::Query(err.to_string());
    Ok(SessionRecord {
        session_handle: row.try_get("session_handle").map_err(read)?,
        user_id: row.try_get("user_id").map_err(read)?,
        session_data: row.try_get("session_data").map_err(read)?,
        jwt_user_payload: row.try_get("jwt_user_payload").map_err(read)?,
        refresh_token_version: row.try_get("refresh_token_version").map_err(read)?,
        anti_csrf_token: row.try_get("anti_csrf_token").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        expires_at: row.try_get("expires_at").map_err(read)?,
    })
}

fn key_from_row(row: &PgRow) -> Result<SigningKeyRecord, StorageError> {
    let read = |err: sqlx::Error| StorageError::Query(err.to_string());
    let private_key: String = row.try_get("private_key").map_err(read)?;
    Ok(SigningKeyRecord {
        key_id: row.try_get("key_id").map_err(read)?,
        algorithm: row.try_get("algorithm").map_err(read)?,
        public_key_pem: row.try_get("public_key").map_err(read)?,
        private_key_pem: SecretString::from(private_key),
        created_at: row.try_get("created_at").map_err(read)?,
        expires_at: row.try_get("expires_at").map_err(read)?,
    })
}

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

#[async_trait]
impl AuthStorage for PostgresStorage {
    async fn save_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        let query = "INSERT INTO sessions (session_handle, user_id, session_data, jwt_user_payload, refresh_token_version, anti_csrf_token, created_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";
        sqlx::query(query)
            .bind(&session.session_handle)
            .bind(&session.user_id)
            .bind(&session.session_data)
            .bind(&session.jwt_user_payload)
            .bind(session.refresh_token_version)
            .bind(session.anti_csrf_token.as_deref())
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_session(&self, handle: &str) -> Result<Option<SessionRecord>, StorageError> {
        let query = "SELECT session_handle, user_id, session_data, jwt_user_payload, refresh_token_version, anti_csrf_token, created_at, expires_at FROM sessions WHERE session_handle = $1";
        let row = sqlx::query(query)
            .bind(handle)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn update_session_version(
        &self,
        handle: &str,
        expected_version: i64,
        new_version: i64,
        anti_csrf_token: Option<&str>,
        expires_at: i64,
    ) -> Result<VersionCas, StorageError> {
        let query = "UPDATE sessions SET refresh_token_version = $3, anti_csrf_token = $4, expires_at = $5 WHERE session_handle = $1 AND refresh_token_version = $2";
        let result = sqlx::query(query)
            .bind(handle)
            .bind(expected_version)
            .bind(new_version)
            .bind(anti_csrf_token)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 1 {
            return Ok(VersionCas::Updated);
        }

        // The CAS failed; distinguish a stale version from a deleted session.
        let probe = "SELECT refresh_token_version FROM sessions WHERE session_handle = $1";
        let row = sqlx::query(probe)
            .bind(handle)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", probe))
            .await
            .map_err(map_sqlx_error)?;
        match row {
            Some(row) => {
                let current_version: i64 = row
                    .try_get("refresh_token_version")
                    .map_err(|err| StorageError::Query(err.to_string()))?;
                Ok(VersionCas::Stale { current_version })
            }
            None => Ok(VersionCas::Missing),
        }
    }

    async fn update_session_data(&self, handle: &str, data: &Value) -> Result<bool, StorageError> {
        let query = "UPDATE sessions SET session_data = $2 WHERE session_handle = $1";
        let result = sqlx::query(query)
            .bind(handle)
            .bind(data)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_session(&self, handle: &str) -> Result<bool, StorageError> {
        let query = "DELETE FROM sessions WHERE session_handle = $1";
        let result = sqlx::query(query)
            .bind(handle)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_sessions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        let query = "DELETE FROM sessions WHERE user_id = $1 RETURNING session_handle";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                row.try_get("session_handle")
                    .map_err(|err| StorageError::Query(err.to_string()))
            })
            .collect()
    }

    async fn delete_expired_sessions(&self, now: i64) -> Result<u64, StorageError> {
        let query = "DELETE FROM sessions WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn save_signing_key(&self, key: &SigningKeyRecord) -> Result<(), StorageError> {
        // Conditional insert keeps multi-process rotation idempotent: the
        // insert is refused while any unexpired key is newer-or-equal, and the
        // caller adopts the winner instead.
        let query = "INSERT INTO signing_keys (key_id, algorithm, public_key, private_key, created_at, expires_at) SELECT $1, $2, $3, $4, $5, $6 WHERE NOT EXISTS (SELECT 1 FROM signing_keys WHERE expires_at > $5)";
        let result = sqlx::query(query)
            .bind(&key.key_id)
            .bind(&key.algorithm)
            .bind(&key.public_key_pem)
            .bind(key.private_key_pem.expose_secret())
            .bind(key.created_at)
            .bind(key.expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }
        Ok(())
    }

    async fn get_current_signing_key(&self) -> Result<Option<SigningKeyRecord>, StorageError> {
        let query = "SELECT key_id, algorithm, public_key, private_key, created_at, expires_at FROM signing_keys ORDER BY created_at DESC LIMIT 1";
        let row = sqlx::query(query)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(key_from_row).transpose()
    }

    async fn get_signing_key_by_id(
        &self,
        key_id: &str,
    ) -> Result<Option<SigningKeyRecord>, StorageError> {
        let query = "SELECT key_id, algorithm, public_key, private_key, created_at, expires_at FROM signing_keys WHERE key_id = $1";
        let row = sqlx::query(query)
            .bind(key_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(key_from_row).transpose()
    }

    async fn blacklist_token(&self, handle: &str) -> Result<(), StorageError> {
        let query = "INSERT INTO token_blacklist (session_handle, blacklisted_at) VALUES ($1, $2) ON CONFLICT (session_handle) DO NOTHING";
        sqlx::query(query)
            .bind(handle)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn is_token_blacklisted(&self, handle: &str) -> Result<bool, StorageError> {
        let query = "SELECT 1 AS present FROM token_blacklist WHERE session_handle = $1";
        let row = sqlx::query(query)
            .bind(handle)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }
}
