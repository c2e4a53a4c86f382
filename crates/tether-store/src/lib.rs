pub mod presence;
pub mod rooms;

use redis::aio::ConnectionManager;
use thiserror::Error;

pub use presence::{MemoryPresence, PresenceBackend, RedisPresence};
pub use rooms::{JoinOutcome, MemoryRooms, RedisRooms, RoomBackend};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store did not answer. Callers fall back to the
    /// in-process backend on this variant.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One shared multiplexed Redis connection per process. The manager
/// reconnects with backoff on its own; callers never block indefinitely on
/// a dead connection, they get an error and degrade.
#[derive(Clone)]
pub struct RedisHandle {
    manager: ConnectionManager,
}

impl RedisHandle {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {pong}")))
        }
    }
}

/// Persisted key shapes shared by both backends.
pub mod keys {
    pub fn session(token_hash: &str) -> String {
        format!("session:{token_hash}")
    }

    pub fn session_index(identifier: &str) -> String {
        format!("session-index:{identifier}")
    }

    pub fn transport_index(transport_id: &str) -> String {
        format!("transport-index:{transport_id}")
    }

    pub fn room(room_id: &str) -> String {
        format!("room:{room_id}")
    }

    pub fn room_members(room_id: &str) -> String {
        format!("room:{room_id}:members")
    }

    pub fn room_member(room_id: &str, member_id: &str) -> String {
        format!("room:{room_id}:member:{member_id}")
    }
}

/// Cursor-driven SCAN; the iterator API has shifted between redis-rs
/// releases, the raw command has not.
pub(crate) async fn scan_keys(
    conn: &mut ConnectionManager,
    pattern: &str,
) -> StoreResult<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(200)
            .query_async(conn)
            .await?;
        keys.extend(batch);
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    Ok(keys)
}

pub(crate) fn parse_bool_field(value: &str) -> bool {
    matches!(value, "1" | "true")
}

pub(crate) fn bool_field(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

pub(crate) fn datetime_field(
    value: &str,
) -> StoreResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid datetime '{value}': {e}")))
}
