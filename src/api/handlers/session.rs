use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{Extension, Query},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;
use utoipa::{IntoParams, ToSchema};

use crate::api::handlers::error_response;
use crate::engine::{CreatedSession, SessionEngine, SessionInfo};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(default)]
    pub user_data_in_database: Value,
    #[serde(default)]
    pub user_data_in_jwt: Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    pub session_handle: String,
    pub user_id: String,
    pub user_data_in_jwt: Value,
    /// Unix milliseconds.
    pub expiry: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenBody {
    pub token: String,
    /// Unix milliseconds.
    pub expiry: i64,
    /// Unix milliseconds.
    pub created_time: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub status: String,
    pub session: SessionBody,
    pub access_token: TokenBody,
    pub refresh_token: TokenBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionRequest {
    pub access_token: String,
    #[serde(default)]
    pub anti_csrf_token: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionResponse {
    pub status: String,
    pub session: SessionBody,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSessionRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSessionRequest {
    #[serde(default)]
    pub session_handle: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSessionResponse {
    pub status: String,
    pub session_handles_revoked: Vec<String>,
}

#[derive(IntoParams, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct SessionDataArgs {
    pub session_handle: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionDataResponse {
    pub status: String,
    pub user_data_in_database: Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PutSessionDataRequest {
    pub session_handle: String,
    #[serde(default)]
    pub user_data_in_database: Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct StatusResponse {
    pub status: String,
}

type HandlerResult<T> = Result<(StatusCode, Json<T>), (StatusCode, String)>;

fn session_response(created: CreatedSession) -> SessionResponse {
    SessionResponse {
        status: "OK".to_string(),
        session: SessionBody {
            session_handle: created.session.session_handle,
            user_id: created.session.user_id,
            user_data_in_jwt: created.session.user_payload,
            expiry: created.session.expires_at,
        },
        access_token: TokenBody {
            token: created.access_token.token,
            expiry: created.access_token.expires_at,
            created_time: created.access_token.created_at,
        },
        refresh_token: TokenBody {
            token: created.refresh_token.token,
            expiry: created.refresh_token.expires_at,
            created_time: created.refresh_token.created_at,
        },
        anti_csrf_token: created.anti_csrf_token,
    }
}

fn session_body(info: SessionInfo) -> SessionBody {
    SessionBody {
        session_handle: info.session_handle,
        user_id: info.user_id,
        user_data_in_jwt: info.user_payload,
        expiry: info.expires_at,
    }
}

fn require_json<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, (StatusCode, String)> {
    payload
        .map(|Json(body)| body)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid Json Input".to_string()))
}

#[utoipa::path(
    post,
    path= "/session",
    request_body = CreateSessionRequest,
    responses (
        (status = 200, description = "Session created", body = SessionResponse),
        (status = 400, description = "Malformed input", body = String),
        (status = 500, description = "Storage or signing failure", body = String)
    ),
    tag = "session",
)]
#[instrument(skip(engine, payload))]
pub async fn create_session(
    Extension(engine): Extension<Arc<SessionEngine>>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> HandlerResult<SessionResponse> {
    let request = require_json(payload)?;
    let created = engine
        .create_session(
            &request.user_id,
            request.user_data_in_database,
            request.user_data_in_jwt,
        )
        .await
        .map_err(|err| error_response(&err, engine.config()))?;
    Ok((StatusCode::OK, Json(session_response(created))))
}

#[utoipa::path(
    post,
    path= "/session/verify",
    request_body = VerifySessionRequest,
    responses (
        (status = 200, description = "Access token is valid", body = VerifySessionResponse),
        (status = 400, description = "Malformed input", body = String),
        (status = 440, description = "Token invalid, expired, or anti-CSRF mismatch", body = String)
    ),
    tag = "session",
)]
#[instrument(skip(engine, payload))]
pub async fn verify_session(
    Extension(engine): Extension<Arc<SessionEngine>>,
    payload: Result<Json<VerifySessionRequest>, JsonRejection>,
) -> HandlerResult<VerifySessionResponse> {
    let request = require_json(payload)?;
    let info = engine
        .verify_session(&request.access_token, request.anti_csrf_token.as_deref())
        .await
        .map_err(|err| error_response(&err, engine.config()))?;
    Ok((
        StatusCode::OK,
        Json(VerifySessionResponse {
            status: "OK".to_string(),
            session: session_body(info),
        }),
    ))
}

#[utoipa::path(
    post,
    path= "/session/refresh",
    request_body = RefreshSessionRequest,
    responses (
        (status = 200, description = "Tokens rotated", body = SessionResponse),
        (status = 400, description = "Malformed input", body = String),
        (status = 440, description = "Refresh token invalid, reused, or session gone", body = String)
    ),
    tag = "session",
)]
#[instrument(skip(engine, payload))]
pub async fn refresh_session(
    Extension(engine): Extension<Arc<SessionEngine>>,
    payload: Result<Json<RefreshSessionRequest>, JsonRejection>,
) -> HandlerResult<SessionResponse> {
    let request = require_json(payload)?;
    let created = engine
        .refresh_session(&request.refresh_token)
        .await
        .map_err(|err| error_response(&err, engine.config()))?;
    Ok((StatusCode::OK, Json(session_response(created))))
}

#[utoipa::path(
    post,
    path= "/session/remove",
    request_body = RemoveSessionRequest,
    responses (
        (status = 200, description = "Sessions revoked", body = RemoveSessionResponse),
        (status = 400, description = "Malformed input", body = String),
        (status = 500, description = "Storage failure", body = String)
    ),
    tag = "session",
)]
#[instrument(skip(engine, payload))]
pub async fn remove_session(
    Extension(engine): Extension<Arc<SessionEngine>>,
    payload: Result<Json<RemoveSessionRequest>, JsonRejection>,
) -> HandlerResult<RemoveSessionResponse> {
    let request = require_json(payload)?;

    let revoked = match (request.session_handle, request.user_id) {
        (Some(handle), None) => {
            let deleted = engine
                .revoke_session(&handle)
                .await
                .map_err(|err| error_response(&err, engine.config()))?;
            if deleted { vec![handle] } else { Vec::new() }
        }
        (None, Some(user_id)) => engine
            .revoke_all_for_user(&user_id)
            .await
            .map_err(|err| error_response(&err, engine.config()))?,
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "Provide exactly one of sessionHandle or userId".to_string(),
            ))
        }
    };

    Ok((
        StatusCode::OK,
        Json(RemoveSessionResponse {
            status: "OK".to_string(),
            session_handles_revoked: revoked,
        }),
    ))
}

#[utoipa::path(
    get,
    path= "/session/data",
    params(SessionDataArgs),
    responses (
        (status = 200, description = "Session data", body = SessionDataResponse),
        (status = 400, description = "Missing sessionHandle", body = String),
        (status = 440, description = "Session does not exist", body = String)
    ),
    tag = "session",
)]
#[instrument(skip(engine, query))]
pub async fn get_session_data(
    Extension(engine): Extension<Arc<SessionEngine>>,
    query: Result<Query<SessionDataArgs>, QueryRejection>,
) -> HandlerResult<SessionDataResponse> {
    let Query(args) = query
        .map_err(|_| (StatusCode::BAD_REQUEST, "Missing sessionHandle".to_string()))?;
    let data = engine
        .get_session_data(&args.session_handle)
        .await
        .map_err(|err| error_response(&err, engine.config()))?;
    Ok((
        StatusCode::OK,
        Json(SessionDataResponse {
            status: "OK".to_string(),
            user_data_in_database: data,
        }),
    ))
}

#[utoipa::path(
    put,
    path= "/session/data",
    request_body = PutSessionDataRequest,
    responses (
        (status = 200, description = "Session data replaced", body = StatusResponse),
        (status = 400, description = "Malformed input", body = String),
        (status = 440, description = "Session does not exist", body = String)
    ),
    tag = "session",
)]
#[instrument(skip(engine, payload))]
pub async fn put_session_data(
    Extension(engine): Extension<Arc<SessionEngine>>,
    payload: Result<Json<PutSessionDataRequest>, JsonRejection>,
) -> HandlerResult<StatusResponse> {
    let request = require_json(payload)?;
    engine
        .update_session_data(&request.session_handle, request.user_data_in_database)
        .await
        .map_err(|err| error_response(&err, engine.config()))?;
    Ok((
        StatusCode::OK,
        Json(StatusResponse {
            status: "OK".to_string(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn engine() -> Arc<SessionEngine> {
        Arc::new(SessionEngine::new(
            EngineConfig::default(),
            Arc::new(MemoryStorage::new()),
        ))
    }

    async fn create(engine: &Arc<SessionEngine>, user_id: &str) -> SessionResponse {
        let (status, Json(response)) = create_session(
            Extension(engine.clone()),
            Ok(Json(CreateSessionRequest {
                user_id: user_id.to_string(),
                user_data_in_database: json!({"k": "v"}),
                user_data_in_jwt: json!({"role": "user"}),
            })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        response
    }

    #[tokio::test]
    async fn create_verify_refresh_roundtrip() {
        let engine = engine();
        let created = create(&engine, "user-1").await;
        assert_eq!(created.status, "OK");
        assert_eq!(created.session.user_id, "user-1");

        let (status, Json(verified)) = verify_session(
            Extension(engine.clone()),
            Ok(Json(VerifySessionRequest {
                access_token: created.access_token.token.clone(),
                anti_csrf_token: created.anti_csrf_token.clone(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verified.session.session_handle, created.session.session_handle);

        let (status, Json(refreshed)) = refresh_session(
            Extension(engine),
            Ok(Json(RefreshSessionRequest {
                refresh_token: created.refresh_token.token,
            })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_ne!(refreshed.access_token.token, created.access_token.token);
    }

    #[tokio::test]
    async fn refresh_reuse_maps_to_the_session_expired_status() {
        let engine = engine();
        let created = create(&engine, "user-1").await;

        refresh_session(
            Extension(engine.clone()),
            Ok(Json(RefreshSessionRequest {
                refresh_token: created.refresh_token.token.clone(),
            })),
        )
        .await
        .unwrap();

        let (status, body) = refresh_session(
            Extension(engine),
            Ok(Json(RefreshSessionRequest {
                refresh_token: created.refresh_token.token,
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(status.as_u16(), 440);
        assert_eq!(body, "token theft detected");
    }

    #[tokio::test]
    async fn remove_requires_exactly_one_selector() {
        let engine = engine();
        let (status, _) = remove_session(
            Extension(engine.clone()),
            Ok(Json(RemoveSessionRequest::default())),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = remove_session(
            Extension(engine),
            Ok(Json(RemoveSessionRequest {
                session_handle: Some("h".to_string()),
                user_id: Some("u".to_string()),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn remove_by_handle_and_by_user() {
        let engine = engine();
        let first = create(&engine, "user-1").await;
        let second = create(&engine, "user-1").await;

        let (_, Json(removed)) = remove_session(
            Extension(engine.clone()),
            Ok(Json(RemoveSessionRequest {
                session_handle: Some(first.session.session_handle.clone()),
                user_id: None,
            })),
        )
        .await
        .unwrap();
        assert_eq!(
            removed.session_handles_revoked,
            vec![first.session.session_handle.clone()]
        );

        let (_, Json(removed)) = remove_session(
            Extension(engine.clone()),
            Ok(Json(RemoveSessionRequest {
                session_handle: None,
                user_id: Some("user-1".to_string()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(
            removed.session_handles_revoked,
            vec![second.session.session_handle.clone()]
        );

        // Idempotent on a now-unknown handle.
        let (_, Json(removed)) = remove_session(
            Extension(engine),
            Ok(Json(RemoveSessionRequest {
                session_handle: Some(second.session.session_handle),
                user_id: None,
            })),
        )
        .await
        .unwrap();
        assert!(removed.session_handles_revoked.is_empty());
    }

    #[tokio::test]
    async fn session_data_endpoints_roundtrip() {
        let engine = engine();
        let created = create(&engine, "user-1").await;
        let handle = created.session.session_handle;

        let (_, Json(data)) = get_session_data(
            Extension(engine.clone()),
            Ok(Query(SessionDataArgs {
                session_handle: handle.clone(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(data.user_data_in_database, json!({"k": "v"}));

        put_session_data(
            Extension(engine.clone()),
            Ok(Json(PutSessionDataRequest {
                session_handle: handle.clone(),
                user_data_in_database: json!({"k": "v2"}),
            })),
        )
        .await
        .unwrap();

        let (_, Json(data)) = get_session_data(
            Extension(engine.clone()),
            Ok(Query(SessionDataArgs {
                session_handle: handle,
            })),
        )
        .await
        .unwrap();
        assert_eq!(data.user_data_in_database, json!({"k": "v2"}));

        let (status, _) = get_session_data(
            Extension(engine),
            Ok(Query(SessionDataArgs {
                session_handle: "unknown".to_string(),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(status.as_u16(), 440);
    }

    #[tokio::test]
    async fn invalid_json_body_is_rejected_with_the_fixed_message() {
        let engine = engine();
        let rejection = Json::<CreateSessionRequest>::from_bytes(b"{").unwrap_err();
        let (status, body) = create_session(Extension(engine), Err(rejection))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid Json Input");
    }
}
