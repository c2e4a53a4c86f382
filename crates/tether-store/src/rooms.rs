use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tether_models::{MemberDetail, Room};

use crate::{
    bool_field, datetime_field, keys, parse_bool_field, scan_keys, RedisHandle, StoreError,
    StoreResult,
};

/// Result of an atomic capacity-checked join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    Full,
    RoomMissing,
}

/// Storage capability for the room store.
#[async_trait]
pub trait RoomBackend: Send + Sync {
    /// Write room metadata (not membership) and refresh the room's TTL.
    async fn upsert_room(&self, room: &Room, ttl: Duration) -> StoreResult<()>;

    /// Metadata plus the persisted member list, sorted.
    async fn get_room(&self, room_id: &str) -> StoreResult<Option<Room>>;

    async fn delete_room(&self, room_id: &str) -> StoreResult<bool>;

    async fn list_rooms(&self) -> StoreResult<Vec<Room>>;

    /// Capacity check + append as one observably-atomic round trip. The
    /// capacity bound is read from the persisted room, not from the caller,
    /// so no interleaving of concurrent joins can overshoot it.
    async fn add_member(
        &self,
        room_id: &str,
        member_id: &str,
        detail: &MemberDetail,
        ttl: Duration,
    ) -> StoreResult<JoinOutcome>;

    /// Returns false when the member was not present.
    async fn remove_member(&self, room_id: &str, member_id: &str) -> StoreResult<bool>;

    async fn members(&self, room_id: &str) -> StoreResult<Vec<String>>;

    async fn member_detail(
        &self,
        room_id: &str,
        member_id: &str,
    ) -> StoreResult<Option<MemberDetail>>;

    async fn ping(&self) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Redis

// Existence, membership, capacity, append and TTL refresh in one EVAL so the
// capacity invariant holds across gateway processes sharing the store.
const JOIN_SCRIPT: &str = r#"
local room_key = KEYS[1]
local members_key = KEYS[2]
local detail_key = KEYS[3]
local member = ARGV[1]
local joined_at = ARGV[2]
local role = ARGV[3]
local ttl = tonumber(ARGV[4])
if redis.call('EXISTS', room_key) == 0 then
  return 'not-found'
end
if redis.call('SISMEMBER', members_key, member) == 1 then
  return 'already-member'
end
local max = tonumber(redis.call('HGET', room_key, 'max_members') or '0')
if max > 0 and redis.call('SCARD', members_key) >= max then
  return 'full'
end
redis.call('SADD', members_key, member)
redis.call('HSET', detail_key, 'joined_at', joined_at, 'role', role)
if ttl > 0 then
  local room_ttl = redis.call('TTL', room_key)
  if room_ttl > 0 then
    ttl = room_ttl
  end
  redis.call('EXPIRE', members_key, ttl)
  redis.call('EXPIRE', detail_key, ttl)
end
return 'joined'
"#;

fn join_script() -> &'static redis::Script {
    static SCRIPT: OnceLock<redis::Script> = OnceLock::new();
    SCRIPT.get_or_init(|| redis::Script::new(JOIN_SCRIPT))
}

pub struct RedisRooms {
    handle: RedisHandle,
}

impl RedisRooms {
    pub fn new(handle: RedisHandle) -> Self {
        Self { handle }
    }

    fn room_fields(room: &Room) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", room.id.clone()),
            ("name", room.name.clone()),
            ("allow_self_join", bool_field(room.allow_self_join).to_string()),
            (
                "max_members",
                room.max_members.unwrap_or(0).to_string(),
            ),
            ("is_private", bool_field(room.is_private).to_string()),
            ("created_at", room.created_at.to_rfc3339()),
            ("updated_at", room.updated_at.to_rfc3339()),
        ];
        if let Some(desc) = &room.description {
            fields.push(("description", desc.clone()));
        }
        fields
    }

    fn parse_room(map: &HashMap<String, String>, members: Vec<String>) -> StoreResult<Room> {
        let field = |name: &str| -> StoreResult<&String> {
            map.get(name)
                .ok_or_else(|| StoreError::Corrupt(format!("room missing field '{name}'")))
        };
        let max_members = field("max_members")?
            .parse::<u32>()
            .map_err(|e| StoreError::Corrupt(format!("invalid max_members: {e}")))?;
        Ok(Room {
            id: field("id")?.clone(),
            name: field("name")?.clone(),
            description: map.get("description").cloned(),
            allow_self_join: parse_bool_field(field("allow_self_join")?),
            max_members: (max_members > 0).then_some(max_members),
            is_private: parse_bool_field(field("is_private")?),
            members,
            created_at: datetime_field(field("created_at")?)?,
            updated_at: datetime_field(field("updated_at")?)?,
        })
    }
}

#[async_trait]
impl RoomBackend for RedisRooms {
    async fn upsert_room(&self, room: &Room, ttl: Duration) -> StoreResult<()> {
        let rkey = keys::room(&room.id);
        let mkey = keys::room_members(&room.id);
        let ttl_secs = ttl.as_secs() as i64;
        let mut conn = self.handle.connection();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&rkey).ignore();
        pipe.hset_multiple(&rkey, &Self::room_fields(room)).ignore();
        pipe.expire(&rkey, ttl_secs).ignore();
        pipe.expire(&mkey, ttl_secs).ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        // Member-detail keys share the room's TTL.
        let members: Vec<String> = conn.smembers(&mkey).await?;
        if !members.is_empty() {
            let mut pipe = redis::pipe();
            for member in &members {
                pipe.expire(keys::room_member(&room.id, member), ttl_secs)
                    .ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        let mut conn = self.handle.connection();
        let map: HashMap<String, String> = conn.hgetall(keys::room(room_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let mut members: Vec<String> = conn.smembers(keys::room_members(room_id)).await?;
        members.sort();
        Ok(Some(Self::parse_room(&map, members)?))
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<bool> {
        let mut conn = self.handle.connection();
        let members: Vec<String> = conn.smembers(keys::room_members(room_id)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(keys::room(room_id));
        pipe.del(keys::room_members(room_id)).ignore();
        for member in &members {
            pipe.del(keys::room_member(room_id, member)).ignore();
        }
        let (deleted,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
        let mut conn = self.handle.connection();
        let all_keys = scan_keys(&mut conn, "room:*").await?;
        let mut rooms = Vec::new();
        for key in all_keys {
            // `room:{id}` only; membership and detail keys have further
            // segments and room ids cannot contain ':'.
            let Some(id) = key.strip_prefix("room:") else {
                continue;
            };
            if id.contains(':') {
                continue;
            }
            if let Some(room) = self.get_room(id).await? {
                rooms.push(room);
            }
        }
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rooms)
    }

    async fn add_member(
        &self,
        room_id: &str,
        member_id: &str,
        detail: &MemberDetail,
        ttl: Duration,
    ) -> StoreResult<JoinOutcome> {
        let mut conn = self.handle.connection();
        let outcome: String = join_script()
            .key(keys::room(room_id))
            .key(keys::room_members(room_id))
            .key(keys::room_member(room_id, member_id))
            .arg(member_id)
            .arg(detail.joined_at.to_rfc3339())
            .arg(&detail.role)
            .arg(ttl.as_secs() as i64)
            .invoke_async(&mut conn)
            .await?;
        match outcome.as_str() {
            "joined" => Ok(JoinOutcome::Joined),
            "already-member" => Ok(JoinOutcome::AlreadyMember),
            "full" => Ok(JoinOutcome::Full),
            "not-found" => Ok(JoinOutcome::RoomMissing),
            other => Err(StoreError::Corrupt(format!(
                "unexpected join outcome '{other}'"
            ))),
        }
    }

    async fn remove_member(&self, room_id: &str, member_id: &str) -> StoreResult<bool> {
        let mut conn = self.handle.connection();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(keys::room_members(room_id), member_id);
        pipe.del(keys::room_member(room_id, member_id)).ignore();
        let (removed,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn members(&self, room_id: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.handle.connection();
        let mut members: Vec<String> = conn.smembers(keys::room_members(room_id)).await?;
        members.sort();
        Ok(members)
    }

    async fn member_detail(
        &self,
        room_id: &str,
        member_id: &str,
    ) -> StoreResult<Option<MemberDetail>> {
        let mut conn = self.handle.connection();
        let map: HashMap<String, String> =
            conn.hgetall(keys::room_member(room_id, member_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let joined_at = map
            .get("joined_at")
            .ok_or_else(|| StoreError::Corrupt("member detail missing joined_at".into()))?;
        Ok(Some(MemberDetail {
            joined_at: datetime_field(joined_at)?,
            role: map.get("role").cloned().unwrap_or_else(|| "member".into()),
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.handle.ping().await
    }
}

// ---------------------------------------------------------------------------
// In-process fallback

struct MemoryRoom {
    room: Room,
    members: HashMap<String, MemberDetail>,
    expires_at: Instant,
}

/// Single-process room map. One mutex serializes every read-check-write, so
/// the capacity invariant holds without the Lua script.
#[derive(Default)]
pub struct MemoryRooms {
    inner: Mutex<HashMap<String, MemoryRoom>>,
}

impl MemoryRooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let before = inner.len();
        inner.retain(|_, r| r.expires_at > now);
        before - inner.len()
    }

    fn snapshot(entry: &MemoryRoom) -> Room {
        let mut room = entry.room.clone();
        let mut members: Vec<String> = entry.members.keys().cloned().collect();
        members.sort();
        room.members = members;
        room
    }
}

#[async_trait]
impl RoomBackend for MemoryRooms {
    async fn upsert_room(&self, room: &Room, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let expires_at = Instant::now() + ttl;
        match inner.get_mut(&room.id) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.room = room.clone();
                entry.expires_at = expires_at;
            }
            _ => {
                inner.insert(
                    room.id.clone(),
                    MemoryRoom {
                        room: room.clone(),
                        members: HashMap::new(),
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(inner
            .get(room_id)
            .filter(|r| r.expires_at > Instant::now())
            .map(Self::snapshot))
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(inner.remove(room_id).is_some())
    }

    async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let mut rooms: Vec<Room> = inner
            .values()
            .filter(|r| r.expires_at > now)
            .map(Self::snapshot)
            .collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rooms)
    }

    async fn add_member(
        &self,
        room_id: &str,
        member_id: &str,
        detail: &MemberDetail,
        _ttl: Duration,
    ) -> StoreResult<JoinOutcome> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = inner
            .get_mut(room_id)
            .filter(|r| r.expires_at > Instant::now())
        else {
            return Ok(JoinOutcome::RoomMissing);
        };
        if entry.members.contains_key(member_id) {
            return Ok(JoinOutcome::AlreadyMember);
        }
        if let Some(max) = entry.room.max_members {
            if entry.members.len() as u32 >= max {
                return Ok(JoinOutcome::Full);
            }
        }
        entry.members.insert(member_id.to_string(), detail.clone());
        Ok(JoinOutcome::Joined)
    }

    async fn remove_member(&self, room_id: &str, member_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(inner
            .get_mut(room_id)
            .map(|entry| entry.members.remove(member_id).is_some())
            .unwrap_or(false))
    }

    async fn members(&self, room_id: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut members: Vec<String> = inner
            .get(room_id)
            .filter(|r| r.expires_at > Instant::now())
            .map(|r| r.members.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn member_detail(
        &self,
        room_id: &str,
        member_id: &str,
    ) -> StoreResult<Option<MemberDetail>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(inner
            .get(room_id)
            .filter(|r| r.expires_at > Instant::now())
            .and_then(|r| r.members.get(member_id).cloned()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
