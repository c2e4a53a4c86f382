use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tether_core::registry::{NewSubscription, SubscriptionUpdate};
use tether_core::AppState;
use tether_models::Subscription;

use crate::error::ApiError;
use crate::middleware::AuthIdentity;

fn subscription_json(sub: &Subscription) -> Value {
    json!({
        "id": sub.id,
        "event_name": sub.event_name,
        "replicable": sub.replicable,
        "include_sender": sub.include_sender,
        "description": sub.description,
        "parameters": sub.parameters,
        "created_at": sub.created_at.to_rfc3339(),
        "updated_at": sub.updated_at.to_rfc3339(),
    })
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub event_name: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let subs = match query.event_name.as_deref() {
        Some(name) => state.registry.list_by_event_name(name),
        None => state.registry.list_all(),
    };
    let items: Vec<Value> = subs.iter().map(subscription_json).collect();
    let count = items.len();
    Json(json!({ "subscriptions": items, "count": count }))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let sub = state.registry.get(&id).ok_or(ApiError::NotFound)?;
    Ok(Json(subscription_json(&sub)))
}

pub async fn create(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Json(body): Json<NewSubscription>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (sub, replaced) = state.registry.create(body)?;
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let mut payload = subscription_json(&sub);
    payload["replaced"] = json!(replaced);
    Ok((status, Json(payload)))
}

pub async fn update(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Path(id): Path<String>,
    Json(body): Json<SubscriptionUpdate>,
) -> Result<Json<Value>, ApiError> {
    let sub = state.registry.update(&id, body)?;
    Ok(Json(subscription_json(&sub)))
}

pub async fn delete(
    State(state): State<AppState>,
    _auth: AuthIdentity,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_all(
    State(state): State<AppState>,
    _auth: AuthIdentity,
) -> Json<Value> {
    let count = state.registry.delete_all();
    Json(json!({ "deleted": count }))
}
