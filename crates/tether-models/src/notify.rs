use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle transition of a presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceChange {
    Connected,
    Updated,
    Disconnected,
}

/// One entry of the presence notification stream exposed to observability
/// collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceNotification {
    pub change: PresenceChange,
    pub token_hash: String,
    pub transport_id: String,
    /// Stable identifier, when the record carried one.
    pub stable_id: Option<String>,
    pub at: DateTime<Utc>,
}
