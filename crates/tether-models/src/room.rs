use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Room metadata plus its persisted member list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether members may join and leave on their own. When false, only
    /// trusted (operator) calls may change membership.
    pub allow_self_join: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_members: Option<u32>,
    pub is_private: bool,
    /// Persisted membership, by stable identifier.
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn is_full(&self) -> bool {
        match self.max_members {
            Some(max) => self.members.len() as u32 >= max,
            None => false,
        }
    }
}

/// Per-member join details, sharing the room's TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDetail {
    pub joined_at: DateTime<Utc>,
    pub role: String,
}

impl MemberDetail {
    pub fn member() -> Self {
        Self {
            joined_at: Utc::now(),
            role: "member".to_string(),
        }
    }
}
