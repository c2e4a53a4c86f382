//! End-to-end flow over the wired service graph: authenticate, write
//! presence, join a room, emit a validated event, observe the broadcast.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_core::registry::NewSubscription;
use tether_core::router::{EmitContext, RouteStatus};
use tether_core::rooms::CreateRoom;
use tether_core::{AppConfig, AppState, Broadcaster};
use tether_models::{ParameterKind, ParameterSpec, SessionRecord};

#[derive(Debug, Clone)]
struct Emission {
    group: Option<String>,
    event: String,
    data: Value,
    except: Option<String>,
}

#[derive(Default)]
struct RecordingBroadcaster {
    groups: Mutex<Vec<(String, String)>>,
    emissions: Mutex<Vec<Emission>>,
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn join_group(&self, transport_id: &str, group: &str) {
        self.groups
            .lock()
            .unwrap()
            .push((group.to_string(), transport_id.to_string()));
    }
    async fn leave_group(&self, transport_id: &str, group: &str) {
        self.groups
            .lock()
            .unwrap()
            .retain(|(g, t)| !(g == group && t == transport_id));
    }
    async fn emit_to_group(&self, group: &str, event: &str, data: &Value, except: Option<&str>) {
        self.emissions.lock().unwrap().push(Emission {
            group: Some(group.to_string()),
            event: event.to_string(),
            data: data.clone(),
            except: except.map(str::to_string),
        });
    }
    async fn emit_to_all(&self, event: &str, data: &Value, except: Option<&str>) {
        self.emissions.lock().unwrap().push(Emission {
            group: None,
            event: event.to_string(),
            data: data.clone(),
            except: except.map(str::to_string),
        });
    }
    async fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

fn state() -> (AppState, Arc<RecordingBroadcaster>) {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let state = AppState::build(
        AppConfig::default(),
        "integration-secret".to_string(),
        None,
        None,
        broadcaster.clone(),
    );
    (state, broadcaster)
}

async fn connect(state: &AppState, token: &str, transport: &str) -> String {
    let verified = state.identity.verify(token).expect("verify");
    let record = SessionRecord::new(String::new(), transport.into(), verified.identifiers);
    state.presence.put(token, record).await.expect("presence put");
    verified.stable_id
}

fn issue(state: &AppState, stable: &str) -> String {
    let mut bag = serde_json::Map::new();
    bag.insert("id".into(), json!(stable));
    bag.insert("display_name".into(), json!(stable.to_uppercase()));
    state.identity.issue(bag).expect("issue token")
}

#[tokio::test]
async fn authenticated_room_chat_flow() {
    let (state, broadcaster) = state();

    let token = issue(&state, "alice");
    let sender = connect(&state, &token, "t-alice").await;
    assert_eq!(sender, "alice");

    state
        .rooms
        .create_room(CreateRoom {
            id: Some("lobby".into()),
            name: "Lobby".into(),
            description: None,
            allow_self_join: true,
            max_members: None,
            is_private: false,
        })
        .await
        .expect("create room");

    let join = state
        .rooms
        .add_member("lobby", "alice", Some("t-alice"))
        .await
        .expect("join");
    assert!(join.success);

    let session = state.presence.get(&token).await.expect("get").expect("record");
    state
        .presence
        .update_rooms(&token, vec!["lobby".into()])
        .await
        .expect("update rooms");
    assert_eq!(session.transport_id, "t-alice");

    let mut message = ParameterSpec::new("message", ParameterKind::String);
    message.required = true;
    message.sanitize = true;
    state
        .registry
        .create(NewSubscription {
            event_name: "chat-message".into(),
            replicable: true,
            include_sender: false,
            description: Some("room chat".into()),
            parameters: Some(vec![message]),
        })
        .expect("subscription");

    let ctx = EmitContext {
        transport_id: "t-alice".into(),
        sender_id: sender,
    };
    let reply = state
        .router
        .route(
            &ctx,
            "chat-message",
            &json!({"message": "<script>boom()</script>hello lobby", "room_id": "lobby"}),
        )
        .await;
    assert_eq!(reply.status, RouteStatus::Delivered);

    let emissions = broadcaster.emissions.lock().unwrap().clone();
    // member-joined announcement plus the routed chat message
    assert_eq!(emissions.len(), 2);
    let chat = emissions
        .iter()
        .find(|e| e.event == "chat-message")
        .expect("chat emission");
    assert_eq!(chat.group.as_deref(), Some("lobby"));
    assert_eq!(chat.except.as_deref(), Some("t-alice"));
    let text = chat.data.get("message").unwrap().as_str().unwrap();
    assert!(!text.contains("<script"));
    assert!(text.contains("hello lobby"));
    assert_eq!(chat.data.get("sender").unwrap(), &json!("alice"));
}

#[tokio::test]
async fn privacy_sensitive_events_stay_on_the_backend() {
    let (state, broadcaster) = state();
    let token = issue(&state, "bob");
    let sender = connect(&state, &token, "t-bob").await;

    state
        .registry
        .create(NewSubscription {
            event_name: "location-ping".into(),
            replicable: false,
            include_sender: false,
            description: None,
            parameters: None,
        })
        .expect("subscription");

    let ctx = EmitContext {
        transport_id: "t-bob".into(),
        sender_id: sender,
    };
    let reply = state
        .router
        .route(&ctx, "location-ping", &json!({"lat": 1.0, "lon": 2.0}))
        .await;
    assert_eq!(reply.status, RouteStatus::Accepted);
    assert!(broadcaster.emissions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn subscription_replacement_scenario() {
    let (state, _) = state();

    let (_, replaced) = state
        .registry
        .create(NewSubscription {
            event_name: "ping".into(),
            replicable: true,
            include_sender: false,
            description: None,
            parameters: None,
        })
        .expect("first create");
    assert!(!replaced);

    let (_, replaced) = state
        .registry
        .create(NewSubscription {
            event_name: "ping".into(),
            replicable: false,
            include_sender: false,
            description: None,
            parameters: None,
        })
        .expect("second create");
    assert!(replaced);

    let listed = state.registry.list_by_event_name("ping");
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].replicable);
}
