use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tether_core::rooms::{CreateRoom, RoomUpdate};
use tether_core::AppState;
use tether_models::Room;

use crate::error::ApiError;
use crate::middleware::AuthIdentity;

fn room_json(room: &Room) -> Value {
    json!({
        "id": room.id,
        "name": room.name,
        "description": room.description,
        "allow_self_join": room.allow_self_join,
        "max_members": room.max_members,
        "is_private": room.is_private,
        "members": room.members,
        "member_count": room.members.len(),
        "created_at": room.created_at.to_rfc3339(),
        "updated_at": room.updated_at.to_rfc3339(),
    })
}

/// Persisted rooms reconciled with the transport layer's live groups.
pub async fn list_live(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rooms = state.rooms.list_live_rooms().await?;
    let count = rooms.len();
    Ok(Json(json!({ "rooms": rooms, "count": count })))
}

pub async fn create(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Json(body): Json<CreateRoom>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let room = state.rooms.create_room(body).await?;
    Ok((StatusCode::CREATED, Json(room_json(&room))))
}

pub async fn get(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let room = state.rooms.get_room(&room_id).await?;
    Ok(Json(room_json(&room)))
}

pub async fn update(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Path(room_id): Path<String>,
    Json(body): Json<RoomUpdate>,
) -> Result<Json<Value>, ApiError> {
    let room = state.rooms.update_room(&room_id, body).await?;
    Ok(Json(room_json(&room)))
}

pub async fn delete(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.rooms.delete_room(&room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub member_id: String,
}

/// Trusted membership add: bypasses the self-join policy by design.
pub async fn add_member(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Path(room_id): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> Result<Json<Value>, ApiError> {
    // Attach the member's live session, if one is connected right now.
    let live = state
        .presence
        .get_by_identifier(state.presence.stable_key(), &body.member_id)
        .await?;
    let result = state
        .rooms
        .add_member(&room_id, &body.member_id, live.as_ref().map(|s| s.transport_id.as_str()))
        .await?;
    Ok(Json(json!({ "success": result.success, "message": result.message })))
}

#[derive(Deserialize)]
pub struct RemoveMemberQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove_member(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Path((room_id, member_id)): Path<(String, String)>,
    Query(query): Query<RemoveMemberQuery>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .rooms
        .remove_member(&room_id, &member_id, query.force)
        .await?;
    Ok(Json(json!({ "success": result.success, "reason": result.reason })))
}

pub async fn can_join(
    State(state): State<AppState>,
    Path((room_id, member_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let check = state.rooms.can_join(&room_id, &member_id).await?;
    Ok(Json(serde_json::to_value(check).unwrap_or_default()))
}
