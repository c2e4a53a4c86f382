use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tether_models::notify::PresenceChange;
use tether_models::SessionRecord;
use tether_store::{MemoryPresence, PresenceBackend, StoreResult};
use tether_util::hashing::token_hash;
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::events::NotifyBus;

/// Result of a presence write.
#[derive(Debug)]
pub struct PutOutcome {
    /// False when an existing record for the same token was overwritten.
    pub created: bool,
    /// A session evicted because it held the same stable identifier under a
    /// different token (reconnect race, last writer wins).
    pub displaced: Option<SessionRecord>,
}

/// The distributed session directory. Lives on the primary backend (Redis)
/// and degrades to an in-process map when the store stops answering;
/// degraded mode is single-instance and logged, never fatal.
pub struct PresenceDirectory {
    primary: Arc<dyn PresenceBackend>,
    fallback: Arc<MemoryPresence>,
    distributed: bool,
    degraded: AtomicBool,
    ttl: Duration,
    stable_key: String,
    notify: NotifyBus,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceDirectory {
    pub fn new(
        primary: Option<Arc<dyn PresenceBackend>>,
        stable_key: String,
        ttl: Duration,
        notify: NotifyBus,
    ) -> Self {
        let fallback = Arc::new(MemoryPresence::new());
        let (primary, distributed) = match primary {
            Some(p) => (p, true),
            None => (fallback.clone() as Arc<dyn PresenceBackend>, false),
        };
        Self {
            primary,
            fallback,
            distributed,
            degraded: AtomicBool::new(false),
            ttl,
            stable_key,
            notify,
            sweeper: Mutex::new(None),
        }
    }

    pub fn stable_key(&self) -> &str {
        &self.stable_key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn notify(&self) -> &NotifyBus {
        &self.notify
    }

    /// Run one backend operation, falling back to the in-process map when
    /// the primary reports unavailability.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn PresenceBackend>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        if self.distributed && !self.degraded() {
            match op(self.primary.clone()).await {
                Err(e) if e.is_unavailable() => {
                    tracing::warn!(
                        error = %e,
                        "presence store unavailable, serving from in-process fallback"
                    );
                    self.degraded.store(true, Ordering::Relaxed);
                }
                other => return other.map_err(CoreError::from),
            }
        }
        let fallback: Arc<dyn PresenceBackend> = self.fallback.clone();
        op(fallback).await.map_err(CoreError::from)
    }

    /// Upsert the session for this token: the record plus both secondary
    /// indexes land as one atomic write group. Emits `connected` for new
    /// records and `updated` for overwrites; a displaced session (same
    /// stable identifier, different token) emits `disconnected`.
    pub async fn put(
        &self,
        token: &str,
        mut record: SessionRecord,
    ) -> Result<PutOutcome, CoreError> {
        record.token_hash = token_hash(token);
        let stable = record.identifier(&self.stable_key);

        let mut displaced = None;
        if let Some(sid) = stable.as_deref() {
            let holder = self
                .run(|b| {
                    let sid = sid.to_string();
                    async move { b.token_for_identifier(&sid).await }
                })
                .await?;
            if let Some(holder) = holder.filter(|h| *h != record.token_hash) {
                displaced = self
                    .run(|b| {
                        let holder = holder.clone();
                        async move { b.remove(&holder).await }
                    })
                    .await?;
                if let Some(old) = &displaced {
                    tracing::info!(
                        stable_id = %sid,
                        old_transport = %old.transport_id,
                        new_transport = %record.transport_id,
                        "stable identifier reclaimed, evicting previous session"
                    );
                    self.notify
                        .presence(PresenceChange::Disconnected, old, &self.stable_key);
                }
            }
        }

        let existed = self
            .run(|b| {
                let record = record.clone();
                let stable = stable.clone();
                let ttl = self.ttl;
                async move { b.put(&record, stable.as_deref(), ttl).await }
            })
            .await?;

        let change = if existed {
            PresenceChange::Updated
        } else {
            PresenceChange::Connected
        };
        self.notify.presence(change, &record, &self.stable_key);
        Ok(PutOutcome {
            created: !existed,
            displaced,
        })
    }

    pub async fn get(&self, token: &str) -> Result<Option<SessionRecord>, CoreError> {
        let hash = token_hash(token);
        self.run(|b| {
            let hash = hash.clone();
            async move { b.get(&hash).await }
        })
        .await
    }

    pub async fn get_by_transport_id(
        &self,
        transport_id: &str,
    ) -> Result<Option<SessionRecord>, CoreError> {
        self.run(|b| {
            let id = transport_id.to_string();
            async move { b.get_by_transport(&id).await }
        })
        .await
    }

    /// Identifier lookup. Indexed (one round trip) only for the stable key;
    /// any other key falls back to a scan over live records.
    pub async fn get_by_identifier(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<SessionRecord>, CoreError> {
        if key == self.stable_key {
            let token = self
                .run(|b| {
                    let value = value.to_string();
                    async move { b.token_for_identifier(&value).await }
                })
                .await?;
            let Some(hash) = token else {
                return Ok(None);
            };
            return self
                .run(|b| {
                    let hash = hash.clone();
                    async move { b.get(&hash).await }
                })
                .await;
        }

        let records = self.run(|b| async move { b.scan().await }).await?;
        Ok(records
            .into_iter()
            .find(|r| r.identifier(key).as_deref() == Some(value)))
    }

    /// Delete the record and its indexes; emits `disconnected`.
    pub async fn remove(&self, token: &str) -> Result<Option<SessionRecord>, CoreError> {
        let hash = token_hash(token);
        let removed = self
            .run(|b| {
                let hash = hash.clone();
                async move { b.remove(&hash).await }
            })
            .await?;
        if let Some(record) = &removed {
            self.notify
                .presence(PresenceChange::Disconnected, record, &self.stable_key);
        }
        Ok(removed)
    }

    /// Refresh the TTL without rewriting the record. Returns false when the
    /// record is gone (expired, or evicted by a reconnect elsewhere) — the
    /// caller should treat the session as dead.
    pub async fn touch(&self, token: &str) -> Result<bool, CoreError> {
        let hash = token_hash(token);
        self.run(|b| {
            let hash = hash.clone();
            let ttl = self.ttl;
            async move { b.touch(&hash, ttl).await }
        })
        .await
    }

    /// Partial update: the room list and last-seen stamp only.
    pub async fn update_rooms(
        &self,
        token: &str,
        rooms: Vec<String>,
    ) -> Result<bool, CoreError> {
        let hash = token_hash(token);
        self.run(|b| {
            let hash = hash.clone();
            let rooms = rooms.clone();
            let ttl = self.ttl;
            async move { b.update_rooms(&hash, &rooms, Utc::now(), ttl).await }
        })
        .await
    }

    /// Start the background sweeper: purges expired fallback entries and
    /// probes a degraded primary so the directory recovers on its own.
    pub fn start(self: &Arc<Self>) {
        let dir = Arc::clone(self);
        let period = self.ttl.checked_div(2).unwrap_or(self.ttl).max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // skip immediate first tick
            loop {
                ticker.tick().await;
                let purged = dir.fallback.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "presence sweep: dropped expired sessions");
                }
                dir.probe_primary().await;
            }
        });
        *self.sweeper.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    async fn probe_primary(&self) {
        if self.distributed && self.degraded() && self.primary.ping().await.is_ok() {
            self.degraded.store(false, Ordering::Relaxed);
            tracing::info!("presence store answering again, leaving degraded mode");
        }
    }
}
