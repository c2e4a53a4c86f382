mod handler;
mod session;

pub use session::ConnectionRegistry;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use tether_core::AppState;

#[derive(Clone)]
struct GatewayState {
    app: AppState,
    connections: Arc<ConnectionRegistry>,
}

pub fn gateway_router(app: AppState, connections: Arc<ConnectionRegistry>) -> Router {
    Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(GatewayState { app, connections })
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    let query_token = params.get("token").cloned();
    let header_token = bearer_token(&headers);
    ws.on_upgrade(move |socket| {
        handler::handle_connection(socket, state.app, state.connections, query_token, header_token)
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn bearer_tokens_parse_from_the_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&basic), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
