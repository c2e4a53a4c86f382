use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tether_core::{AppConfig, AppState, Broadcaster};
use tower::ServiceExt;

#[derive(Debug, Clone)]
struct Emission {
    group: Option<String>,
    event: String,
    data: Value,
}

#[derive(Default)]
struct RecordingBroadcaster {
    emissions: Mutex<Vec<Emission>>,
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn join_group(&self, _transport_id: &str, _group: &str) {}
    async fn leave_group(&self, _transport_id: &str, _group: &str) {}
    async fn emit_to_group(&self, group: &str, event: &str, data: &Value, _except: Option<&str>) {
        self.emissions.lock().unwrap().push(Emission {
            group: Some(group.to_string()),
            event: event.to_string(),
            data: data.clone(),
        });
    }
    async fn emit_to_all(&self, event: &str, data: &Value, _except: Option<&str>) {
        self.emissions.lock().unwrap().push(Emission {
            group: None,
            event: event.to_string(),
            data: data.clone(),
        });
    }
    async fn group_members(&self, _group: &str) -> Vec<String> {
        Vec::new()
    }
}

struct TestContext {
    app: Router,
    token: String,
    broadcaster: Arc<RecordingBroadcaster>,
}

impl TestContext {
    fn new() -> Self {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let state = AppState::build(
            AppConfig::default(),
            "route-test-secret".to_string(),
            None,
            None,
            broadcaster.clone(),
        );
        let mut bag = serde_json::Map::new();
        bag.insert("id".into(), json!("operator"));
        let token = state.identity.issue(bag).expect("token");
        let app = tether_api::build_router().with_state(state);
        Self {
            app,
            token,
            broadcaster,
        }
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        authed: bool,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if authed {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token));
        }
        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };

        let response = self.app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            // Extractor rejections are plain text, everything else is JSON.
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }
}

#[tokio::test]
async fn subscription_crud_and_replacement() {
    let ctx = TestContext::new();

    let (status, first) = ctx
        .request(
            Method::POST,
            "/api/v1/subscriptions",
            true,
            Some(json!({"event_name": "ping", "replicable": true})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["replaced"], json!(false));

    let (status, second) = ctx
        .request(
            Method::POST,
            "/api/v1/subscriptions",
            true,
            Some(json!({"event_name": "ping", "replicable": false})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["replaced"], json!(true));

    let (status, listed) = ctx
        .request(
            Method::GET,
            "/api/v1/subscriptions?event_name=ping",
            false,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["count"], json!(1));
    assert_eq!(listed["subscriptions"][0]["replicable"], json!(false));

    let id = second["id"].as_str().unwrap().to_string();
    let (status, updated) = ctx
        .request(
            Method::PATCH,
            &format!("/api/v1/subscriptions/{id}"),
            true,
            Some(json!({"description": "latency probe"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["description"], json!("latency probe"));

    let (status, deleted) = ctx
        .request(Method::DELETE, "/api/v1/subscriptions", true, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["deleted"], json!(1));
}

#[tokio::test]
async fn subscription_mutations_require_a_token() {
    let ctx = TestContext::new();
    let (status, _) = ctx
        .request(
            Method::POST,
            "/api/v1/subscriptions",
            false,
            Some(json!({"event_name": "ping"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = ctx
        .request(
            Method::POST,
            "/api/v1/subscriptions",
            true,
            Some(json!({"event_name": "join-room"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn room_capacity_over_http() {
    let ctx = TestContext::new();

    let (status, _) = ctx
        .request(
            Method::POST,
            "/api/v1/rooms",
            true,
            Some(json!({
                "id": "general",
                "name": "General",
                "allow_self_join": true,
                "max_members": 2
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    for member in ["alice", "bob"] {
        let (status, body) = ctx
            .request(
                Method::POST,
                "/api/v1/rooms/general/members",
                true,
                Some(json!({"member_id": member})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
    }

    let (status, third) = ctx
        .request(
            Method::POST,
            "/api/v1/rooms/general/members",
            true,
            Some(json!({"member_id": "carol"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(third["success"], json!(false));
    assert_eq!(third["message"], json!("room is full"));

    let (status, room) = ctx
        .request(Method::GET, "/api/v1/rooms/general", false, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(room["member_count"], json!(2));

    let (_, check) = ctx
        .request(
            Method::GET,
            "/api/v1/rooms/general/can-join/dave",
            false,
            None,
        )
        .await;
    assert_eq!(check["can_join"], json!(false));
}

#[tokio::test]
async fn forced_member_removal_overrides_policy() {
    let ctx = TestContext::new();
    ctx.request(
        Method::POST,
        "/api/v1/rooms",
        true,
        Some(json!({"id": "locked", "name": "Locked", "allow_self_join": false})),
    )
    .await;
    ctx.request(
        Method::POST,
        "/api/v1/rooms/locked/members",
        true,
        Some(json!({"member_id": "alice"})),
    )
    .await;

    let (_, refused) = ctx
        .request(
            Method::DELETE,
            "/api/v1/rooms/locked/members/alice",
            true,
            None,
        )
        .await;
    assert_eq!(refused["success"], json!(false));

    let (_, forced) = ctx
        .request(
            Method::DELETE,
            "/api/v1/rooms/locked/members/alice?force=true",
            true,
            None,
        )
        .await;
    assert_eq!(forced["success"], json!(true));
}

#[tokio::test]
async fn trusted_emit_bypasses_validation() {
    let ctx = TestContext::new();

    // A schema that would reject this payload on the client path.
    ctx.request(
        Method::POST,
        "/api/v1/subscriptions",
        true,
        Some(json!({
            "event_name": "announce",
            "replicable": true,
            "parameters": [{"name": "message", "type": "string", "required": true}]
        })),
    )
    .await;

    let (status, body) = ctx
        .request(
            Method::POST,
            "/api/v1/emit",
            true,
            Some(json!({"event": "announce", "data": {"anything": 1}, "room_id": "ops"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("delivered"));

    let emissions = ctx.broadcaster.emissions.lock().unwrap();
    assert_eq!(emissions.len(), 1);
    assert_eq!(emissions[0].group.as_deref(), Some("ops"));
    assert_eq!(emissions[0].event, "announce");
    assert_eq!(emissions[0].data, json!({"anything": 1}));
}

#[tokio::test]
async fn missing_rooms_return_404() {
    let ctx = TestContext::new();
    let (status, _) = ctx
        .request(Method::GET, "/api/v1/rooms/nowhere", false, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = ctx
        .request(Method::DELETE, "/api/v1/rooms/nowhere", true, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
