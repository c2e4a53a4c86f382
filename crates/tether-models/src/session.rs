use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A live session as tracked by the presence directory.
///
/// Keyed by the SHA-256 hash of the identity token; additionally indexed by
/// the stable identifier and by the transport connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token_hash: String,
    pub transport_id: String,
    pub authenticated: bool,
    /// Caller-chosen identifier bag from the verified token.
    pub identifiers: serde_json::Map<String, Value>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Rooms this session has joined, by room id.
    pub rooms: Vec<String>,
}

impl SessionRecord {
    pub fn new(
        token_hash: String,
        transport_id: String,
        identifiers: serde_json::Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            token_hash,
            transport_id,
            authenticated: true,
            identifiers,
            connected_at: now,
            last_seen: now,
            rooms: Vec::new(),
        }
    }

    /// The value of one identifier, normalized to a string.
    /// Numbers are rendered in decimal; other JSON shapes yield `None`.
    pub fn identifier(&self, key: &str) -> Option<String> {
        match self.identifiers.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
