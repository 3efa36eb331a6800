//! WebSocket attach endpoint and per-leg stream plumbing.
//!
//! `GET /api/call/connect?call_id=…&role=…` upgrades to the duplex call
//! stream. Each socket gets a writer task fed from the leg's bounded
//! egress queue; the read loop parses envelopes and feeds the session
//! inbox. Framing errors produce `error` envelopes and keep the leg alive.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use decoy_broker::{egress_queue, AttachError};
use decoy_types::{CallId, Envelope, ErrorCode, Role};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct CallConnectParams {
    pub call_id: String,
    pub role: String,
}

/// WebSocket handler: `GET /api/call/connect?call_id=…&role=…`
pub async fn call_connect_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<CallConnectParams>,
) -> Response {
    // Parameter validation happens before the upgrade so protocol misuse
    // is a plain client error.
    let role: Role = match params.role.parse() {
        Ok(role) => role,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    };
    if params.call_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "call_id must not be empty"})),
        )
            .into_response();
    }

    let call_id = CallId::from(params.call_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, call_id, role))
}

/// Handles one attached leg for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, call_id: CallId, role: Role) {
    let (mut sender, mut receiver) = socket.split();

    let config = state.registry.config();
    let (queue, mut egress_rx) = egress_queue(
        config.egress_queue_capacity,
        config.egress_block_timeout(),
    );

    let (handle, outcome) = match state.registry.attach(&call_id, role, queue.clone()).await {
        Ok(attached) => attached,
        Err(e) => {
            let code = match e {
                AttachError::RoleOccupied(_) => ErrorCode::RoleOccupied,
                AttachError::ServerBusy | AttachError::Ended => ErrorCode::ServerBusy,
            };
            let refusal = Envelope::Error {
                code,
                message: e.to_string(),
            };
            let _ = sender
                .send(WsMessage::Text(refusal.to_frame().into()))
                .await;
            let _ = sender.close().await;
            return;
        }
    };
    let leg_id = outcome.leg_id;
    tracing::info!(call_id = %call_id, %role, leg_id, "leg connected");

    // Writer: egress queue → socket. Ends when the session closes the
    // queue or the socket dies.
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = egress_rx.recv().await {
            if sender
                .send(WsMessage::Text(envelope.to_frame().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Reader: socket → session inbox.
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(frame) => match Envelope::parse(&frame) {
                Ok(envelope) => handle.ingress(role, leg_id, envelope).await,
                Err(e) => {
                    tracing::debug!(call_id = %call_id, %role, error = %e, "bad ingress frame");
                    let _ = queue
                        .push(Envelope::Error {
                            code: e.code(),
                            message: e.to_string(),
                        })
                        .await;
                }
            },
            WsMessage::Close(_) => break,
            // Binary frames are not part of the protocol; pings are
            // handled by axum itself.
            _ => {}
        }
    }

    tracing::info!(call_id = %call_id, %role, leg_id, "leg disconnected");
    handle.detach(role, leg_id).await;
    send_task.abort();
}
