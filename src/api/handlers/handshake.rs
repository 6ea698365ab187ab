use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;

use crate::api::handlers::error_response;
use crate::engine::SessionEngine;

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDriverInfo {
    #[serde(default, rename = "frontendSDK")]
    pub frontend_sdk: Vec<SdkInfo>,
    #[serde(default)]
    pub driver: Option<SdkInfo>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(default)]
    pub device_driver_info: Option<DeviceDriverInfo>,
}

/// The full client policy in one round trip. Exactly twelve fields; SDKs
/// deserialize this strictly, so nothing may be added or dropped without a
/// wire version bump.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub status: String,
    pub jwt_signing_public_key: String,
    /// Unix milliseconds.
    pub jwt_signing_public_key_expiry_time: i64,
    pub cookie_domain: String,
    pub cookie_secure: bool,
    pub access_token_path: String,
    pub refresh_token_path: String,
    pub enable_anti_csrf: bool,
    pub access_token_blacklisting_enabled: bool,
    pub cookie_same_site: String,
    pub id_refresh_token_path: String,
    pub session_expired_status_code: u16,
}

type HandshakeResult = Result<(StatusCode, Json<HandshakeResponse>), (StatusCode, String)>;

#[utoipa::path(
    post,
    path= "/handshake",
    request_body = HandshakeRequest,
    responses (
        (status = 200, description = "Client policy and current signing public key", body = HandshakeResponse),
        (status = 400, description = "Malformed JSON body", body = String),
        (status = 500, description = "No signing key available", body = String)
    ),
    tag = "session",
)]
#[instrument(skip(engine, payload))]
pub async fn handshake(
    Extension(engine): Extension<Arc<SessionEngine>>,
    payload: Result<Json<HandshakeRequest>, JsonRejection>,
) -> HandshakeResult {
    let Json(request) = payload
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid Json Input".to_string()))?;

    if let Some(info) = &request.device_driver_info {
        debug!("Device driver info: {:?}", info);
    }

    // One key snapshot; the public key and its expiry always agree.
    let key = engine
        .handshake_key()
        .await
        .map_err(|err| error_response(&err, engine.config()))?;
    let config = engine.config();

    let response = HandshakeResponse {
        status: "OK".to_string(),
        jwt_signing_public_key: key.public_key_pem.clone(),
        jwt_signing_public_key_expiry_time: key.expires_at,
        cookie_domain: config.cookie_domain().to_string(),
        cookie_secure: config.cookie_secure(),
        access_token_path: config.access_token_path().to_string(),
        refresh_token_path: config.refresh_token_path().to_string(),
        enable_anti_csrf: config.anti_csrf_enabled(),
        access_token_blacklisting_enabled: config.access_token_blacklisting_enabled(),
        cookie_same_site: config.cookie_same_site().to_string(),
        id_refresh_token_path: config.id_refresh_token_path().to_string(),
        session_expired_status_code: config.session_expired_status_code(),
    };

    Ok((StatusCode::OK, Json(response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::MemoryStorage;

    fn engine() -> Arc<SessionEngine> {
        Arc::new(SessionEngine::new(
            EngineConfig::default(),
            Arc::new(MemoryStorage::new()),
        ))
    }

    #[tokio::test]
    async fn response_has_exactly_twelve_fields() {
        let engine = engine();
        let before = crate::engine::unix_ms();
        let (status, Json(response)) = handshake(Extension(engine), Ok(Json(HandshakeRequest::default())))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(response.jwt_signing_public_key_expiry_time > before);

        let value = serde_json::to_value(&response).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 12);
        for field in [
            "status",
            "jwtSigningPublicKey",
            "jwtSigningPublicKeyExpiryTime",
            "cookieDomain",
            "cookieSecure",
            "accessTokenPath",
            "refreshTokenPath",
            "enableAntiCsrf",
            "accessTokenBlacklistingEnabled",
            "cookieSameSite",
            "idRefreshTokenPath",
            "sessionExpiredStatusCode",
        ] {
            assert!(object.contains_key(field), "missing field {field}");
        }
    }

    #[tokio::test]
    async fn response_reflects_the_configured_policy() {
        let config = EngineConfig::default()
            .with_cookie_domain("example.com".to_string())
            .with_cookie_secure(true)
            .with_cookie_same_site("strict".to_string())
            .with_session_expired_status_code(401);
        let engine = Arc::new(SessionEngine::new(config, Arc::new(MemoryStorage::new())));

        let (_, Json(response)) = handshake(Extension(engine), Ok(Json(HandshakeRequest::default())))
            .await
            .unwrap();

        assert_eq!(response.status, "OK");
        assert_eq!(response.cookie_domain, "example.com");
        assert!(response.cookie_secure);
        assert_eq!(response.cookie_same_site, "strict");
        assert_eq!(response.session_expired_status_code, 401);
        assert!(response.jwt_signing_public_key.contains("BEGIN PUBLIC KEY"));
        assert!(response.jwt_signing_public_key_expiry_time > 0);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_with_the_fixed_message() {
        let engine = engine();
        let rejection = Json::<HandshakeRequest>::from_bytes(b"not-json").unwrap_err();
        let result = handshake(Extension(engine), Err(rejection)).await;
        let (status, body) = result.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid Json Input");
    }

    #[tokio::test]
    async fn missing_body_fields_are_tolerated() {
        let engine = engine();
        let Json(request) = Json::<HandshakeRequest>::from_bytes(b"{}").unwrap();
        let result = handshake(Extension(engine), Ok(Json(request))).await;
        assert!(result.is_ok());
    }
}
