use axum::{
    routing::{delete, get, post},
    Router,
};
use tether_core::AppState;

pub mod error;
pub mod middleware;
pub mod routes;

pub fn build_router() -> Router<AppState> {
    Router::new()
        // Subscriptions
        .route(
            "/api/v1/subscriptions",
            get(routes::subscriptions::list)
                .post(routes::subscriptions::create)
                .delete(routes::subscriptions::delete_all),
        )
        .route(
            "/api/v1/subscriptions/{id}",
            get(routes::subscriptions::get)
                .patch(routes::subscriptions::update)
                .delete(routes::subscriptions::delete),
        )
        // Rooms
        .route(
            "/api/v1/rooms",
            get(routes::rooms::list_live).post(routes::rooms::create),
        )
        .route(
            "/api/v1/rooms/{room_id}",
            get(routes::rooms::get)
                .patch(routes::rooms::update)
                .delete(routes::rooms::delete),
        )
        .route(
            "/api/v1/rooms/{room_id}/members",
            post(routes::rooms::add_member),
        )
        .route(
            "/api/v1/rooms/{room_id}/members/{member_id}",
            delete(routes::rooms::remove_member),
        )
        .route(
            "/api/v1/rooms/{room_id}/can-join/{member_id}",
            get(routes::rooms::can_join),
        )
        // Trusted server emit
        .route("/api/v1/emit", post(routes::emit::server_emit))
        // Middleware layers
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
