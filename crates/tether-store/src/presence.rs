use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tether_models::SessionRecord;

use crate::{
    bool_field, datetime_field, keys, parse_bool_field, scan_keys, RedisHandle, StoreError,
    StoreResult,
};

/// Storage capability for the presence directory. The directory depends on
/// this trait only; Redis and the in-process map are interchangeable.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    /// Upsert the record plus both secondary indexes as one atomic write
    /// group. `stable_id` is the indexed identifier value, when present.
    /// Returns true when a record for this token already existed.
    async fn put(
        &self,
        record: &SessionRecord,
        stable_id: Option<&str>,
        ttl: Duration,
    ) -> StoreResult<bool>;

    async fn get(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>>;

    /// Indexed lookup: stable identifier value -> token hash.
    async fn token_for_identifier(&self, identifier: &str) -> StoreResult<Option<String>>;

    async fn get_by_transport(&self, transport_id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Delete the record and both indexes. Returns the removed record.
    async fn remove(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>>;

    /// Refresh the TTL without rewriting the record. Returns false when the
    /// record no longer exists.
    async fn touch(&self, token_hash: &str, ttl: Duration) -> StoreResult<bool>;

    /// Partial update of the room list and last-seen stamp.
    async fn update_rooms(
        &self,
        token_hash: &str,
        rooms: &[String],
        last_seen: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Full scan of live records. Only used for non-indexed identifier
    /// lookups and the live-room reconciliation.
    async fn scan(&self) -> StoreResult<Vec<SessionRecord>>;

    async fn ping(&self) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Redis

pub struct RedisPresence {
    handle: RedisHandle,
}

impl RedisPresence {
    pub fn new(handle: RedisHandle) -> Self {
        Self { handle }
    }

    fn record_fields(record: &SessionRecord, stable_id: Option<&str>) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("token_hash", record.token_hash.clone()),
            ("transport_id", record.transport_id.clone()),
            ("authenticated", bool_field(record.authenticated).to_string()),
            (
                "identifiers",
                serde_json::Value::Object(record.identifiers.clone()).to_string(),
            ),
            ("connected_at", record.connected_at.to_rfc3339()),
            ("last_seen", record.last_seen.to_rfc3339()),
            ("rooms", serde_json::to_string(&record.rooms).unwrap_or_else(|_| "[]".into())),
        ];
        if let Some(sid) = stable_id {
            fields.push(("stable_id", sid.to_string()));
        }
        fields
    }

    fn parse_record(map: &HashMap<String, String>) -> StoreResult<SessionRecord> {
        let field = |name: &str| -> StoreResult<&String> {
            map.get(name)
                .ok_or_else(|| StoreError::Corrupt(format!("session missing field '{name}'")))
        };
        let identifiers = match serde_json::from_str(field("identifiers")?)? {
            serde_json::Value::Object(m) => m,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "identifiers is not an object: {other}"
                )))
            }
        };
        Ok(SessionRecord {
            token_hash: field("token_hash")?.clone(),
            transport_id: field("transport_id")?.clone(),
            authenticated: parse_bool_field(field("authenticated")?),
            identifiers,
            connected_at: datetime_field(field("connected_at")?)?,
            last_seen: datetime_field(field("last_seen")?)?,
            rooms: serde_json::from_str(field("rooms")?)?,
        })
    }

    async fn fetch(&self, token_hash: &str) -> StoreResult<Option<HashMap<String, String>>> {
        let mut conn = self.handle.connection();
        let map: HashMap<String, String> = conn.hgetall(keys::session(token_hash)).await?;
        if map.is_empty() {
            Ok(None)
        } else {
            Ok(Some(map))
        }
    }
}

#[async_trait]
impl PresenceBackend for RedisPresence {
    async fn put(
        &self,
        record: &SessionRecord,
        stable_id: Option<&str>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let skey = keys::session(&record.token_hash);
        let mut conn = self.handle.connection();

        // Advisory read: previous indexed values so stale index entries are
        // dropped inside the same write group.
        let (old_stable, old_transport): (Option<String>, Option<String>) = redis::pipe()
            .hget(&skey, "stable_id")
            .hget(&skey, "transport_id")
            .query_async(&mut conn)
            .await?;
        let existed = old_transport.is_some();

        let ttl_secs = ttl.as_secs() as i64;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&skey).ignore();
        if let Some(old) = old_stable.as_deref() {
            if stable_id != Some(old) {
                pipe.del(keys::session_index(old)).ignore();
            }
        }
        if let Some(old) = old_transport.as_deref() {
            if old != record.transport_id {
                pipe.del(keys::transport_index(old)).ignore();
            }
        }
        pipe.hset_multiple(&skey, &Self::record_fields(record, stable_id))
            .ignore();
        pipe.expire(&skey, ttl_secs).ignore();
        if let Some(sid) = stable_id {
            let ikey = keys::session_index(sid);
            pipe.set(&ikey, &record.token_hash).ignore();
            pipe.expire(&ikey, ttl_secs).ignore();
        }
        let tkey = keys::transport_index(&record.transport_id);
        pipe.set(&tkey, &record.token_hash).ignore();
        pipe.expire(&tkey, ttl_secs).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(existed)
    }

    async fn get(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>> {
        match self.fetch(token_hash).await? {
            Some(map) => Ok(Some(Self::parse_record(&map)?)),
            None => Ok(None),
        }
    }

    async fn token_for_identifier(&self, identifier: &str) -> StoreResult<Option<String>> {
        let mut conn = self.handle.connection();
        let token: Option<String> = conn.get(keys::session_index(identifier)).await?;
        Ok(token)
    }

    async fn get_by_transport(&self, transport_id: &str) -> StoreResult<Option<SessionRecord>> {
        let mut conn = self.handle.connection();
        let token: Option<String> = conn.get(keys::transport_index(transport_id)).await?;
        match token {
            Some(hash) => self.get(&hash).await,
            None => Ok(None),
        }
    }

    async fn remove(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>> {
        let Some(map) = self.fetch(token_hash).await? else {
            return Ok(None);
        };
        let record = Self::parse_record(&map)?;

        let mut conn = self.handle.connection();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(keys::session(token_hash)).ignore();
        pipe.del(keys::transport_index(&record.transport_id)).ignore();
        if let Some(sid) = map.get("stable_id") {
            pipe.del(keys::session_index(sid)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(Some(record))
    }

    async fn touch(&self, token_hash: &str, ttl: Duration) -> StoreResult<bool> {
        let skey = keys::session(token_hash);
        let mut conn = self.handle.connection();
        let (stable, transport): (Option<String>, Option<String>) = redis::pipe()
            .hget(&skey, "stable_id")
            .hget(&skey, "transport_id")
            .query_async(&mut conn)
            .await?;
        let Some(transport) = transport else {
            return Ok(false);
        };

        let ttl_secs = ttl.as_secs() as i64;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.expire(&skey, ttl_secs).ignore();
        pipe.expire(keys::transport_index(&transport), ttl_secs).ignore();
        if let Some(sid) = stable.as_deref() {
            pipe.expire(keys::session_index(sid), ttl_secs).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }

    async fn update_rooms(
        &self,
        token_hash: &str,
        rooms: &[String],
        last_seen: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let skey = keys::session(token_hash);
        let mut conn = self.handle.connection();
        let (stable, transport): (Option<String>, Option<String>) = redis::pipe()
            .hget(&skey, "stable_id")
            .hget(&skey, "transport_id")
            .query_async(&mut conn)
            .await?;
        let Some(transport) = transport else {
            return Ok(false);
        };

        let ttl_secs = ttl.as_secs() as i64;
        let fields = [
            ("rooms", serde_json::to_string(rooms)?),
            ("last_seen", last_seen.to_rfc3339()),
        ];
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(&skey, &fields).ignore();
        pipe.expire(&skey, ttl_secs).ignore();
        pipe.expire(keys::transport_index(&transport), ttl_secs).ignore();
        if let Some(sid) = stable.as_deref() {
            pipe.expire(keys::session_index(sid), ttl_secs).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }

    async fn scan(&self) -> StoreResult<Vec<SessionRecord>> {
        let mut conn = self.handle.connection();
        let keys = scan_keys(&mut conn, "session:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let map: HashMap<String, String> = conn.hgetall(&key).await?;
            if map.is_empty() {
                continue;
            }
            match Self::parse_record(&map) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(%key, error = %e, "skipping unreadable session record"),
            }
        }
        Ok(records)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.handle.ping().await
    }
}

// ---------------------------------------------------------------------------
// In-process fallback

struct MemoryEntry {
    record: SessionRecord,
    stable_id: Option<String>,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, MemoryEntry>,
    by_identifier: HashMap<String, String>,
    by_transport: HashMap<String, String>,
}

impl MemoryInner {
    fn drop_entry(&mut self, token_hash: &str) -> Option<SessionRecord> {
        let entry = self.sessions.remove(token_hash)?;
        if let Some(sid) = &entry.stable_id {
            if self.by_identifier.get(sid) == Some(&token_hash.to_string()) {
                self.by_identifier.remove(sid);
            }
        }
        if self.by_transport.get(&entry.record.transport_id)
            == Some(&token_hash.to_string())
        {
            self.by_transport.remove(&entry.record.transport_id);
        }
        Some(entry.record)
    }

    fn live(&self, token_hash: &str) -> Option<&MemoryEntry> {
        self.sessions
            .get(token_hash)
            .filter(|e| e.expires_at > Instant::now())
    }
}

/// Single-process presence map. Every operation takes one lock, so the
/// record and its indexes can never be observed out of step.
#[derive(Default)]
pub struct MemoryPresence {
    inner: Mutex<MemoryInner>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries and their indexes. Driven by the presence
    /// directory's sweeper.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for token_hash in &expired {
            inner.drop_entry(token_hash);
        }
        expired.len()
    }
}

#[async_trait]
impl PresenceBackend for MemoryPresence {
    async fn put(
        &self,
        record: &SessionRecord,
        stable_id: Option<&str>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let existed = inner.live(&record.token_hash).is_some();
        inner.drop_entry(&record.token_hash);
        if let Some(sid) = stable_id {
            inner
                .by_identifier
                .insert(sid.to_string(), record.token_hash.clone());
        }
        inner
            .by_transport
            .insert(record.transport_id.clone(), record.token_hash.clone());
        inner.sessions.insert(
            record.token_hash.clone(),
            MemoryEntry {
                record: record.clone(),
                stable_id: stable_id.map(str::to_string),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(existed)
    }

    async fn get(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(inner.live(token_hash).map(|e| e.record.clone()))
    }

    async fn token_for_identifier(&self, identifier: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let token = inner.by_identifier.get(identifier).cloned();
        Ok(token.filter(|t| inner.live(t).is_some()))
    }

    async fn get_by_transport(&self, transport_id: &str) -> StoreResult<Option<SessionRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let token = inner.by_transport.get(transport_id).cloned();
        Ok(token
            .and_then(|t| inner.live(&t).map(|e| e.record.clone())))
    }

    async fn remove(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let was_live = inner.live(token_hash).is_some();
        let record = inner.drop_entry(token_hash);
        Ok(record.filter(|_| was_live))
    }

    async fn touch(&self, token_hash: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.live(token_hash).is_none() {
            return Ok(false);
        }
        if let Some(entry) = inner.sessions.get_mut(token_hash) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(true)
    }

    async fn update_rooms(
        &self,
        token_hash: &str,
        rooms: &[String],
        last_seen: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.live(token_hash).is_none() {
            return Ok(false);
        }
        if let Some(entry) = inner.sessions.get_mut(token_hash) {
            entry.record.rooms = rooms.to_vec();
            entry.record.last_seen = last_seen;
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(true)
    }

    async fn scan(&self) -> StoreResult<Vec<SessionRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        Ok(inner
            .sessions
            .values()
            .filter(|e| e.expires_at > now)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
