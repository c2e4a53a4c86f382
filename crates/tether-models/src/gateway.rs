use serde::{Deserialize, Serialize};
use serde_json::Value;

// Event names with dedicated gateway handlers. The dynamic router defers on
// these so a payload can never shadow a built-in operation.
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_JOIN_ROOM: &str = "join-room";
pub const EVENT_LEAVE_ROOM: &str = "leave-room";

pub const RESERVED_EVENTS: [&str; 5] = [
    EVENT_CONNECT,
    EVENT_DISCONNECT,
    EVENT_ERROR,
    EVENT_JOIN_ROOM,
    EVENT_LEAVE_ROOM,
];

// Membership announcements broadcast to a room's live members.
pub const EVENT_MEMBER_JOINED: &str = "member-joined";
pub const EVENT_MEMBER_LEFT: &str = "member-left";

/// Field of an inbound payload that scopes a broadcast to one room.
pub const ROOM_SCOPE_FIELD: &str = "room_id";

pub fn is_reserved_event(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

/// Client -> server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Identify {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        resume: bool,
    },
    Heartbeat,
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    Emit {
        event: String,
        #[serde(default)]
        data: Value,
        /// When present, the server always answers with a `reply` frame.
        #[serde(default)]
        callback_id: Option<String>,
    },
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Ready {
        transport_id: String,
        heartbeat_interval_ms: u64,
    },
    /// Sent only to a resumed session, after its rooms were rejoined.
    Reconnected {
        rooms: Vec<String>,
    },
    HeartbeatAck,
    RoomJoined {
        room_id: String,
    },
    RoomLeft {
        room_id: String,
    },
    Event {
        event: String,
        data: Value,
    },
    Reply {
        callback_id: String,
        data: Value,
    },
    Error {
        code: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_names_cover_the_builtin_handlers() {
        for name in ["connect", "disconnect", "error", "join-room", "leave-room"] {
            assert!(is_reserved_event(name), "{name} should be reserved");
        }
        assert!(!is_reserved_event("chat-message"));
    }

    #[test]
    fn identify_frame_parses_with_and_without_token() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"op": "identify", "token": "abc", "resume": true}))
                .unwrap();
        match frame {
            ClientFrame::Identify { token, resume } => {
                assert_eq!(token.as_deref(), Some("abc"));
                assert!(resume);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let frame: ClientFrame = serde_json::from_value(json!({"op": "identify"})).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Identify {
                token: None,
                resume: false
            }
        ));
    }

    #[test]
    fn emit_frame_defaults_data_to_null() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"op": "emit", "event": "ping"})).unwrap();
        match frame {
            ClientFrame::Emit {
                event,
                data,
                callback_id,
            } => {
                assert_eq!(event, "ping");
                assert!(data.is_null());
                assert!(callback_id.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn server_frames_tag_with_snake_case_op() {
        let text = serde_json::to_string(&ServerFrame::HeartbeatAck).unwrap();
        assert_eq!(text, r#"{"op":"heartbeat_ack"}"#);

        let text = serde_json::to_string(&ServerFrame::RoomJoined {
            room_id: "lobby".into(),
        })
        .unwrap();
        assert!(text.contains(r#""op":"room_joined""#));
    }
}
