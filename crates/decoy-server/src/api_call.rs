//! Control-plane handlers: create, end, and inspect calls.

use crate::{api::ApiError, AppState};
use axum::{
    extract::{Extension, Path},
    Json,
};
use decoy_types::{CallId, CallStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Request body for `POST /api/call/start`.
#[derive(Debug, Default, Deserialize)]
pub struct StartCallRequest {
    #[serde(default)]
    pub operator_name: Option<String>,
}

/// Response body with the two join links.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartCallResponse {
    pub call_id: String,
    pub operator_link: String,
    pub scammer_link: String,
    pub status: String,
}

/// Handler for `POST /api/call/start`.
///
/// Allocates a call identifier and returns join links for both roles. The
/// session itself is created lazily on first attach.
pub async fn start_call_handler(
    Extension(_state): Extension<Arc<AppState>>,
    Json(request): Json<StartCallRequest>,
) -> Result<Json<StartCallResponse>, ApiError> {
    let call_id = format!("call-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

    tracing::info!(
        call_id,
        operator = request.operator_name.as_deref().unwrap_or("operator"),
        "call allocated"
    );

    Ok(Json(StartCallResponse {
        operator_link: format!("/api/call/connect?call_id={call_id}&role=operator"),
        scammer_link: format!("/api/call/connect?call_id={call_id}&role=scammer"),
        call_id,
        status: "ready".to_string(),
    }))
}

/// Handler for `POST /api/call/end/{call_id}`.
pub async fn end_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let call_id = CallId::from(call_id);
    if !state.registry.end(&call_id).await {
        return Err(ApiError::NotFound(format!("no active call: {call_id}")));
    }
    Ok(Json(serde_json::json!({
        "status": "ending",
        "call_id": call_id,
    })))
}

/// Handler for `GET /api/call/status/{call_id}`.
pub async fn call_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<CallStatus>, ApiError> {
    let call_id = CallId::from(call_id);
    match state.registry.status(&call_id).await {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::NotFound(format!("no active call: {call_id}"))),
    }
}
