use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tether_core::AppState;

use crate::error::ApiError;
use crate::middleware::AuthIdentity;

#[derive(Deserialize)]
pub struct ServerEmitRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Scope the emit to one room; omitted means every session.
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Trusted server emit: calls the broadcast primitive directly and
/// deliberately bypasses per-subscriber validation. Client-emitted dynamic
/// events always go through the router instead.
pub async fn server_emit(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Json(body): Json<ServerEmitRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.event.is_empty() {
        return Err(ApiError::BadRequest("event name is empty".into()));
    }

    match body.room_id.as_deref() {
        Some(room_id) => {
            state
                .broadcaster
                .emit_to_group(room_id, &body.event, &body.data, None)
                .await;
            Ok(Json(json!({ "status": "delivered", "room_id": room_id })))
        }
        None => {
            state
                .broadcaster
                .emit_to_all(&body.event, &body.data, None)
                .await;
            Ok(Json(json!({ "status": "delivered" })))
        }
    }
}
