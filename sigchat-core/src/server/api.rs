//! HTTP API handlers

use super::listener::AppState;
use crate::identity::IdentityError;
use crate::store::{HistoryPage, MessageSummary, StoreError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

const RECENT_MESSAGES: usize = 10;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

/// Error response with an HTTP status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "Store request failed");
        ApiError::internal("Failed to access messages")
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownUser(_) | IdentityError::NoActiveKey(_) => ApiError {
                status: StatusCode::NOT_FOUND,
                message: "User not found".to_string(),
            },
            other => {
                error!(error = %other, "Identity request failed");
                ApiError::internal("Failed to retrieve public key")
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// GET /api/ping
pub async fn ping(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let count = state.directory.user_count().await?;
    Ok(Json(json!({ "userCount": count })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    pub username: String,
    pub public_key: crate::crypto::EcJwk,
}

/// GET /api/users/:username/publickey
pub async fn public_key(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<Json<PublicKeyResponse>> {
    let public_key = state.directory.resolve_public_key(&username).await?;
    Ok(Json(PublicKeyResponse { username, public_key }))
}

/// GET /api/messages - the most recent messages, newest first
pub async fn recent_messages(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let messages: Vec<MessageSummary> = state
        .store
        .recent(RECENT_MESSAGES)
        .await?
        .iter()
        .map(MessageSummary::from)
        .collect();
    Ok(Json(json!({ "count": messages.len(), "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    user1: Option<String>,
    user2: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /api/message/history?user1&user2&limit&offset
///
/// `limit` is capped at 500.
pub async fn message_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryPage>> {
    let (Some(user1), Some(user2)) = (query.user1, query.user2) else {
        return Err(ApiError::bad_request("Both user1 and user2 parameters are required"));
    };
    let page = state
        .store
        .history(
            &user1,
            &user2,
            query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// POST /api/message/read - bulk DELIVERED -> READ
pub async fn mark_read(
    State(state): State<AppState>,
    Json(request): Json<MarkReadRequest>,
) -> ApiResult<Json<Value>> {
    if request.message_ids.is_empty() {
        return Err(ApiError::bad_request("Valid messageIds array is required"));
    }
    let updated = state.store.mark_read(&request.message_ids).await?;
    Ok(Json(json!({ "ok": true, "updatedCount": updated })))
}
