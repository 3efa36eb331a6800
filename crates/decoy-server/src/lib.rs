//! Decoy server library logic.

pub mod api;
pub mod api_call;
pub mod api_ws;
pub mod config;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use decoy_broker::CallRegistry;
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The call registry; owns session creation and teardown.
    pub registry: CallRegistry,
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/call/start", post(api_call::start_call_handler))
        .route("/api/call/end/{call_id}", post(api_call::end_call_handler))
        .route(
            "/api/call/status/{call_id}",
            get(api_call::call_status_handler),
        )
        .route("/api/call/connect", get(api_ws::call_connect_handler))
        .layer(Extension(Arc::new(state)))
}
