//! Session policy configuration consumed read-only by the engine.
//!
//! Every value advertised by the handshake endpoint comes from this snapshot,
//! and the verification/refresh paths consult the same snapshot, so advertised
//! and enforced policy cannot drift.

use std::time::Duration;

const DEFAULT_COOKIE_DOMAIN: &str = "localhost";
const DEFAULT_COOKIE_SAME_SITE: &str = "lax";
const DEFAULT_ACCESS_TOKEN_PATH: &str = "/";
const DEFAULT_REFRESH_TOKEN_PATH: &str = "/session/refresh";
const DEFAULT_ID_REFRESH_TOKEN_PATH: &str = "/";
const DEFAULT_SESSION_EXPIRED_STATUS_CODE: u16 = 440;
const DEFAULT_ACCESS_TOKEN_VALIDITY_SECONDS: u64 = 3600;
// 100 days, after which the client must log in again
const DEFAULT_REFRESH_TOKEN_VALIDITY_SECONDS: u64 = 100 * 24 * 3600;
const DEFAULT_SIGNING_KEY_VALIDITY_SECONDS: u64 = 7 * 24 * 3600;
const DEFAULT_SIGNING_KEY_GRACE_SECONDS: u64 = 3600;
const DEFAULT_STORAGE_TIMEOUT_MILLIS: u64 = 5000;

/// Read-only session policy snapshot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    cookie_domain: String,
    cookie_secure: bool,
    cookie_same_site: String,
    access_token_path: String,
    refresh_token_path: String,
    id_refresh_token_path: String,
    enable_anti_csrf: bool,
    access_token_blacklisting: bool,
    session_expired_status_code: u16,
    access_token_validity: Duration,
    refresh_token_validity: Duration,
    signing_key_validity: Duration,
    signing_key_grace: Duration,
    storage_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cookie_domain: DEFAULT_COOKIE_DOMAIN.to_string(),
            cookie_secure: false,
            cookie_same_site: DEFAULT_COOKIE_SAME_SITE.to_string(),
            access_token_path: DEFAULT_ACCESS_TOKEN_PATH.to_string(),
            refresh_token_path: DEFAULT_REFRESH_TOKEN_PATH.to_string(),
            id_refresh_token_path: DEFAULT_ID_REFRESH_TOKEN_PATH.to_string(),
            enable_anti_csrf: true,
            access_token_blacklisting: false,
            session_expired_status_code: DEFAULT_SESSION_EXPIRED_STATUS_CODE,
            access_token_validity: Duration::from_secs(DEFAULT_ACCESS_TOKEN_VALIDITY_SECONDS),
            refresh_token_validity: Duration::from_secs(DEFAULT_REFRESH_TOKEN_VALIDITY_SECONDS),
            signing_key_validity: Duration::from_secs(DEFAULT_SIGNING_KEY_VALIDITY_SECONDS),
            signing_key_grace: Duration::from_secs(DEFAULT_SIGNING_KEY_GRACE_SECONDS),
            storage_timeout: Duration::from_millis(DEFAULT_STORAGE_TIMEOUT_MILLIS),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: String) -> Self {
        self.cookie_domain = domain;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_cookie_same_site(mut self, same_site: String) -> Self {
        self.cookie_same_site = same_site;
        self
    }

    #[must_use]
    pub fn with_access_token_path(mut self, path: String) -> Self {
        self.access_token_path = path;
        self
    }

    #[must_use]
    pub fn with_refresh_token_path(mut self, path: String) -> Self {
        self.refresh_token_path = path;
        self
    }

    #[must_use]
    pub fn with_id_refresh_token_path(mut self, path: String) -> Self {
        self.id_refresh_token_path = path;
        self
    }

    #[must_use]
    pub fn with_anti_csrf(mut self, enabled: bool) -> Self {
        self.enable_anti_csrf = enabled;
        self
    }

    #[must_use]
    pub fn with_access_token_blacklisting(mut self, enabled: bool) -> Self {
        self.access_token_blacklisting = enabled;
        self
    }

    #[must_use]
    pub fn with_session_expired_status_code(mut self, code: u16) -> Self {
        self.session_expired_status_code = code;
        self
    }

    #[must_use]
    pub fn with_access_token_validity(mut self, validity: Duration) -> Self {
        self.access_token_validity = validity;
        self
    }

    #[must_use]
    pub fn with_refresh_token_validity(mut self, validity: Duration) -> Self {
        self.refresh_token_validity = validity;
        self
    }

    #[must_use]
    pub fn with_signing_key_validity(mut self, validity: Duration) -> Self {
        self.signing_key_validity = validity;
        self
    }

    #[must_use]
    pub fn with_signing_key_grace(mut self, grace: Duration) -> Self {
        self.signing_key_grace = grace;
        self
    }

    #[must_use]
    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    #[must_use]
    pub fn cookie_domain(&self) -> &str {
        &self.cookie_domain
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn cookie_same_site(&self) -> &str {
        &self.cookie_same_site
    }

    #[must_use]
    pub fn access_token_path(&self) -> &str {
        &self.access_token_path
    }

    #[must_use]
    pub fn refresh_token_path(&self) -> &str {
        &self.refresh_token_path
    }

    #[must_use]
    pub fn id_refresh_token_path(&self) -> &str {
        &self.id_refresh_token_path
    }

    #[must_use]
    pub fn anti_csrf_enabled(&self) -> bool {
        self.enable_anti_csrf
    }

    #[must_use]
    pub fn access_token_blacklisting_enabled(&self) -> bool {
        self.access_token_blacklisting
    }

    #[must_use]
    pub fn session_expired_status_code(&self) -> u16 {
        self.session_expired_status_code
    }

    #[must_use]
    pub fn access_token_validity(&self) -> Duration {
        self.access_token_validity
    }

    #[must_use]
    pub fn refresh_token_validity(&self) -> Duration {
        self.refresh_token_validity
    }

    #[must_use]
    pub fn signing_key_validity(&self) -> Duration {
        self.signing_key_validity
    }

    #[must_use]
    pub fn signing_key_grace(&self) -> Duration {
        self.signing_key_grace
    }

    #[must_use]
    pub fn storage_timeout(&self) -> Duration {
        self.storage_timeout
    }
}
