use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tether_models::gateway::{EVENT_MEMBER_JOINED, EVENT_MEMBER_LEFT};
use tether_models::{MemberDetail, Room};
use tether_store::{JoinOutcome, MemoryRooms, RoomBackend, StoreResult};
use tether_util::validation::{validate_room_id, validate_room_name};

use crate::broadcast::Broadcaster;
use crate::error::CoreError;
use crate::presence::PresenceDirectory;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoom {
    /// Room id; generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub allow_self_join: bool,
    #[serde(default)]
    pub max_members: Option<u32>,
    #[serde(default)]
    pub is_private: bool,
}

fn default_true() -> bool {
    true
}

/// Partial room update. `max_members: 0` clears the capacity limit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub allow_self_join: Option<bool>,
    pub max_members: Option<u32>,
    pub is_private: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanJoin {
    pub can_join: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A room reconciled against the transport layer: `live_members` holds the
/// identities actually reachable right now.
#[derive(Debug, Clone, Serialize)]
pub struct LiveRoom {
    #[serde(flatten)]
    pub room: Room,
    pub live_members: Vec<String>,
    /// True when the member list came from live transport groups rather
    /// than the persisted fallback.
    pub observed_live: bool,
}

/// Room metadata, membership and policy. Capacity is enforced by the
/// backend's atomic join, so concurrent joins on the same room can never
/// overshoot `max_members` even across processes.
pub struct RoomService {
    primary: Arc<dyn RoomBackend>,
    fallback: Arc<MemoryRooms>,
    distributed: bool,
    degraded: AtomicBool,
    room_ttl: Duration,
    auto_create: bool,
    presence: Arc<PresenceDirectory>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl RoomService {
    pub fn new(
        primary: Option<Arc<dyn RoomBackend>>,
        presence: Arc<PresenceDirectory>,
        broadcaster: Arc<dyn Broadcaster>,
        room_ttl: Duration,
        auto_create: bool,
    ) -> Self {
        let fallback = Arc::new(MemoryRooms::new());
        let (primary, distributed) = match primary {
            Some(p) => (p, true),
            None => (fallback.clone() as Arc<dyn RoomBackend>, false),
        };
        Self {
            primary,
            fallback,
            distributed,
            degraded: AtomicBool::new(false),
            room_ttl,
            auto_create,
            presence,
            broadcaster,
        }
    }

    fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn RoomBackend>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        if self.distributed && !self.degraded() {
            match op(self.primary.clone()).await {
                Err(e) if e.is_unavailable() => {
                    tracing::warn!(
                        error = %e,
                        "room store unavailable, serving from in-process fallback"
                    );
                    self.degraded.store(true, Ordering::Relaxed);
                }
                other => return other.map_err(CoreError::from),
            }
        }
        let fallback: Arc<dyn RoomBackend> = self.fallback.clone();
        op(fallback).await.map_err(CoreError::from)
    }

    pub async fn create_room(&self, spec: CreateRoom) -> Result<Room, CoreError> {
        let id = match spec.id {
            Some(id) => {
                validate_room_id(&id).map_err(|e| CoreError::BadRequest(e.to_string()))?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        validate_room_name(&spec.name).map_err(|e| CoreError::BadRequest(e.to_string()))?;

        let now = Utc::now();
        let room = Room {
            id,
            name: spec.name,
            description: spec.description,
            allow_self_join: spec.allow_self_join,
            max_members: spec.max_members.filter(|m| *m > 0),
            is_private: spec.is_private,
            members: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.run(|b| {
            let room = room.clone();
            let ttl = self.room_ttl;
            async move { b.upsert_room(&room, ttl).await }
        })
        .await?;
        Ok(room)
    }

    async fn get_room_opt(&self, room_id: &str) -> Result<Option<Room>, CoreError> {
        self.run(|b| {
            let id = room_id.to_string();
            async move { b.get_room(&id).await }
        })
        .await
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Room, CoreError> {
        self.get_room_opt(room_id).await?.ok_or(CoreError::NotFound)
    }

    pub async fn update_room(&self, room_id: &str, patch: RoomUpdate) -> Result<Room, CoreError> {
        let mut room = self.get_room(room_id).await?;
        if let Some(name) = patch.name {
            validate_room_name(&name).map_err(|e| CoreError::BadRequest(e.to_string()))?;
            room.name = name;
        }
        if let Some(description) = patch.description {
            room.description = Some(description);
        }
        if let Some(allow) = patch.allow_self_join {
            room.allow_self_join = allow;
        }
        if let Some(max) = patch.max_members {
            room.max_members = (max > 0).then_some(max);
        }
        if let Some(private) = patch.is_private {
            room.is_private = private;
        }
        room.updated_at = Utc::now();

        self.run(|b| {
            let room = room.clone();
            let ttl = self.room_ttl;
            async move { b.upsert_room(&room, ttl).await }
        })
        .await?;
        self.get_room(room_id).await
    }

    pub async fn delete_room(&self, room_id: &str) -> Result<(), CoreError> {
        let deleted = self
            .run(|b| {
                let id = room_id.to_string();
                async move { b.delete_room(&id).await }
            })
            .await?;
        if deleted {
            Ok(())
        } else {
            Err(CoreError::NotFound)
        }
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, CoreError> {
        self.run(|b| async move { b.list_rooms().await }).await
    }

    /// Fetch a room for a client-initiated join, auto-creating it when the
    /// deployment allows implicit rooms.
    pub async fn ensure_room(&self, room_id: &str) -> Result<Option<Room>, CoreError> {
        if let Some(room) = self.get_room_opt(room_id).await? {
            return Ok(Some(room));
        }
        if !self.auto_create {
            return Ok(None);
        }
        validate_room_id(room_id).map_err(|e| CoreError::BadRequest(e.to_string()))?;
        let room = self
            .create_room(CreateRoom {
                id: Some(room_id.to_string()),
                name: room_id.to_string(),
                description: None,
                allow_self_join: true,
                max_members: None,
                is_private: false,
            })
            .await?;
        tracing::debug!(room_id = %room.id, "room auto-created on join");
        Ok(Some(room))
    }

    /// Pure join check: existence, current membership, capacity and the
    /// self-join policy. Does not mutate anything.
    pub async fn can_join(&self, room_id: &str, member_id: &str) -> Result<CanJoin, CoreError> {
        let Some(room) = self.get_room_opt(room_id).await? else {
            return Ok(CanJoin {
                can_join: false,
                reason: Some("room not found".into()),
            });
        };
        if room.members.iter().any(|m| m == member_id) {
            return Ok(CanJoin {
                can_join: true,
                reason: Some("already a member".into()),
            });
        }
        if !room.allow_self_join {
            return Ok(CanJoin {
                can_join: false,
                reason: Some("room does not allow self-join".into()),
            });
        }
        if room.is_full() {
            return Ok(CanJoin {
                can_join: false,
                reason: Some("room is full".into()),
            });
        }
        Ok(CanJoin {
            can_join: true,
            reason: None,
        })
    }

    /// Add a member. The capacity check + append happens inside the backend
    /// as one round trip; when a live transport is supplied it also joins
    /// the room's broadcast group. Idempotent for existing members.
    pub async fn add_member(
        &self,
        room_id: &str,
        member_id: &str,
        live_transport: Option<&str>,
    ) -> Result<JoinResult, CoreError> {
        let detail = MemberDetail::member();
        let outcome = self
            .run(|b| {
                let room_id = room_id.to_string();
                let member_id = member_id.to_string();
                let detail = detail.clone();
                let ttl = self.room_ttl;
                async move { b.add_member(&room_id, &member_id, &detail, ttl).await }
            })
            .await?;

        match outcome {
            JoinOutcome::RoomMissing => Ok(JoinResult {
                success: false,
                message: "room not found".into(),
            }),
            JoinOutcome::Full => Ok(JoinResult {
                success: false,
                message: "room is full".into(),
            }),
            JoinOutcome::AlreadyMember => {
                if let Some(transport) = live_transport {
                    self.broadcaster.join_group(transport, room_id).await;
                }
                Ok(JoinResult {
                    success: true,
                    message: "already a member".into(),
                })
            }
            JoinOutcome::Joined => {
                if let Some(transport) = live_transport {
                    self.broadcaster.join_group(transport, room_id).await;
                }
                self.broadcaster
                    .emit_to_group(
                        room_id,
                        EVENT_MEMBER_JOINED,
                        &json!({ "room_id": room_id, "member": member_id }),
                        None,
                    )
                    .await;
                Ok(JoinResult {
                    success: true,
                    message: "joined".into(),
                })
            }
        }
    }

    /// Remove a member. Self-removal is refused on rooms that disallow
    /// self-managed membership unless `force` (trusted path) is set.
    /// Idempotent when the member is absent.
    pub async fn remove_member(
        &self,
        room_id: &str,
        member_id: &str,
        force: bool,
    ) -> Result<RemoveResult, CoreError> {
        let Some(room) = self.get_room_opt(room_id).await? else {
            return Ok(RemoveResult {
                success: false,
                reason: Some("room not found".into()),
            });
        };
        if !room.allow_self_join && !force {
            return Ok(RemoveResult {
                success: false,
                reason: Some("self removal not allowed for this room".into()),
            });
        }

        let removed = self
            .run(|b| {
                let room_id = room_id.to_string();
                let member_id = member_id.to_string();
                async move { b.remove_member(&room_id, &member_id).await }
            })
            .await?;
        if !removed {
            return Ok(RemoveResult {
                success: true,
                reason: Some("not a member".into()),
            });
        }

        // Detach any live session of this identity from the broadcast group.
        if let Some(session) = self
            .presence
            .get_by_identifier(self.presence.stable_key(), member_id)
            .await?
        {
            self.broadcaster
                .leave_group(&session.transport_id, room_id)
                .await;
        }
        self.broadcaster
            .emit_to_group(
                room_id,
                EVENT_MEMBER_LEFT,
                &json!({ "room_id": room_id, "member": member_id }),
                None,
            )
            .await;
        Ok(RemoveResult {
            success: true,
            reason: None,
        })
    }

    pub async fn members(&self, room_id: &str) -> Result<Vec<String>, CoreError> {
        self.run(|b| {
            let id = room_id.to_string();
            async move { b.members(&id).await }
        })
        .await
    }

    pub async fn member_detail(
        &self,
        room_id: &str,
        member_id: &str,
    ) -> Result<Option<MemberDetail>, CoreError> {
        self.run(|b| {
            let room_id = room_id.to_string();
            let member_id = member_id.to_string();
            async move { b.member_detail(&room_id, &member_id).await }
        })
        .await
    }

    /// Reconcile persisted rooms against the transport layer. Identities
    /// observed in the live broadcast group win; when the group is empty
    /// (restart, members on another process) the persisted list is used,
    /// filtered through presence so TTL-expired identities never show up
    /// as live.
    pub async fn list_live_rooms(&self) -> Result<Vec<LiveRoom>, CoreError> {
        let rooms = self.list_rooms().await?;
        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms {
            let transports = self.broadcaster.group_members(&room.id).await;
            let mut live: BTreeSet<String> = BTreeSet::new();
            for transport in &transports {
                if let Some(session) = self.presence.get_by_transport_id(transport).await? {
                    if let Some(stable) = session.identifier(self.presence.stable_key()) {
                        live.insert(stable);
                    }
                }
            }
            let observed_live = !live.is_empty();
            if !observed_live {
                for member in &room.members {
                    if self
                        .presence
                        .get_by_identifier(self.presence.stable_key(), member)
                        .await?
                        .is_some()
                    {
                        live.insert(member.clone());
                    }
                }
            }
            out.push(LiveRoom {
                room,
                live_members: live.into_iter().collect(),
                observed_live,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NotifyBus;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tether_models::SessionRecord;

    #[derive(Default)]
    struct TestBroadcaster {
        groups: Mutex<HashMap<String, Vec<String>>>,
        emitted: Mutex<Vec<(Option<String>, String)>>,
    }

    #[async_trait]
    impl Broadcaster for TestBroadcaster {
        async fn join_group(&self, transport_id: &str, group: &str) {
            self.groups
                .lock()
                .unwrap()
                .entry(group.to_string())
                .or_default()
                .push(transport_id.to_string());
        }
        async fn leave_group(&self, transport_id: &str, group: &str) {
            if let Some(members) = self.groups.lock().unwrap().get_mut(group) {
                members.retain(|t| t != transport_id);
            }
        }
        async fn emit_to_group(&self, group: &str, event: &str, _data: &Value, _except: Option<&str>) {
            self.emitted
                .lock()
                .unwrap()
                .push((Some(group.to_string()), event.to_string()));
        }
        async fn emit_to_all(&self, event: &str, _data: &Value, _except: Option<&str>) {
            self.emitted.lock().unwrap().push((None, event.to_string()));
        }
        async fn group_members(&self, group: &str) -> Vec<String> {
            self.groups
                .lock()
                .unwrap()
                .get(group)
                .cloned()
                .unwrap_or_default()
        }
    }

    fn presence(ttl: Duration) -> Arc<PresenceDirectory> {
        Arc::new(PresenceDirectory::new(
            None,
            "id".into(),
            ttl,
            NotifyBus::default(),
        ))
    }

    fn service(
        presence: Arc<PresenceDirectory>,
        broadcaster: Arc<TestBroadcaster>,
        auto_create: bool,
    ) -> RoomService {
        RoomService::new(
            None,
            presence,
            broadcaster,
            Duration::from_secs(3600),
            auto_create,
        )
    }

    fn create(id: &str, allow_self_join: bool, max: Option<u32>) -> CreateRoom {
        CreateRoom {
            id: Some(id.into()),
            name: id.into(),
            description: None,
            allow_self_join,
            max_members: max,
            is_private: false,
        }
    }

    async fn connect(presence: &PresenceDirectory, token: &str, transport: &str, stable: &str) {
        let mut identifiers = serde_json::Map::new();
        identifiers.insert("id".into(), serde_json::json!(stable));
        presence
            .put(
                token,
                SessionRecord::new(String::new(), transport.into(), identifiers),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn capacity_scenario_alice_bob_carol() {
        let broadcaster = Arc::new(TestBroadcaster::default());
        let svc = service(presence(Duration::from_secs(60)), broadcaster, false);
        svc.create_room(create("general", true, Some(2))).await.unwrap();

        assert!(svc.add_member("general", "alice", None).await.unwrap().success);
        assert!(svc.add_member("general", "bob", None).await.unwrap().success);

        let third = svc.add_member("general", "carol", None).await.unwrap();
        assert!(!third.success);
        assert_eq!(third.message, "room is full");

        let room = svc.get_room("general").await.unwrap();
        assert_eq!(room.members, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn join_is_idempotent_and_records_detail() {
        let broadcaster = Arc::new(TestBroadcaster::default());
        let svc = service(presence(Duration::from_secs(60)), broadcaster.clone(), false);
        svc.create_room(create("general", true, None)).await.unwrap();

        let first = svc.add_member("general", "alice", Some("t1")).await.unwrap();
        assert_eq!(first.message, "joined");
        let again = svc.add_member("general", "alice", Some("t1")).await.unwrap();
        assert!(again.success);
        assert_eq!(again.message, "already a member");

        let detail = svc.member_detail("general", "alice").await.unwrap().unwrap();
        assert_eq!(detail.role, "member");

        // The live session landed in the broadcast group, once per call.
        assert_eq!(broadcaster.group_members("general").await.len(), 2);
        // Only the first join announced itself.
        let announcements = broadcaster.emitted.lock().unwrap();
        assert_eq!(
            announcements
                .iter()
                .filter(|(_, e)| e == EVENT_MEMBER_JOINED)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn self_removal_policy_requires_force() {
        let broadcaster = Arc::new(TestBroadcaster::default());
        let svc = service(presence(Duration::from_secs(60)), broadcaster, false);
        svc.create_room(create("locked", false, None)).await.unwrap();
        svc.add_member("locked", "alice", None).await.unwrap();

        let refused = svc.remove_member("locked", "alice", false).await.unwrap();
        assert!(!refused.success);
        assert!(refused.reason.unwrap().contains("self removal"));

        let forced = svc.remove_member("locked", "alice", true).await.unwrap();
        assert!(forced.success);
        assert!(svc.get_room("locked").await.unwrap().members.is_empty());

        // Absent member: idempotent success.
        let absent = svc.remove_member("locked", "alice", true).await.unwrap();
        assert!(absent.success);
        assert_eq!(absent.reason.as_deref(), Some("not a member"));
    }

    #[tokio::test]
    async fn can_join_combines_policy_capacity_and_existence() {
        let broadcaster = Arc::new(TestBroadcaster::default());
        let svc = service(presence(Duration::from_secs(60)), broadcaster, false);
        svc.create_room(create("closed", false, Some(1))).await.unwrap();

        let missing = svc.can_join("nowhere", "alice").await.unwrap();
        assert!(!missing.can_join);

        let closed = svc.can_join("closed", "alice").await.unwrap();
        assert!(!closed.can_join);
        assert!(closed.reason.unwrap().contains("self-join"));

        svc.create_room(create("open", true, Some(1))).await.unwrap();
        assert!(svc.can_join("open", "alice").await.unwrap().can_join);

        svc.add_member("open", "alice", None).await.unwrap();
        let member_again = svc.can_join("open", "alice").await.unwrap();
        assert!(member_again.can_join);
        assert_eq!(member_again.reason.as_deref(), Some("already a member"));

        let full = svc.can_join("open", "bob").await.unwrap();
        assert!(!full.can_join);
        assert!(full.reason.unwrap().contains("full"));
    }

    #[tokio::test]
    async fn ensure_room_auto_creates_only_when_enabled() {
        let broadcaster = Arc::new(TestBroadcaster::default());
        let svc = service(presence(Duration::from_secs(60)), broadcaster.clone(), false);
        assert!(svc.ensure_room("lobby").await.unwrap().is_none());

        let auto = service(presence(Duration::from_secs(60)), broadcaster, true);
        let room = auto.ensure_room("lobby").await.unwrap().unwrap();
        assert_eq!(room.id, "lobby");
        assert!(room.allow_self_join);
        assert!(auto.get_room("lobby").await.is_ok());
    }

    #[tokio::test]
    async fn live_rooms_prefer_observed_members() {
        let broadcaster = Arc::new(TestBroadcaster::default());
        let presence = presence(Duration::from_secs(60));
        let svc = service(presence.clone(), broadcaster.clone(), false);
        svc.create_room(create("lobby", true, None)).await.unwrap();

        connect(&presence, "token-a", "t1", "alice").await;
        svc.add_member("lobby", "alice", Some("t1")).await.unwrap();
        // A stale persisted member with no live session.
        svc.add_member("lobby", "ghost", None).await.unwrap();

        let live = svc.list_live_rooms().await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].observed_live);
        assert_eq!(live[0].live_members, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn expired_presence_drops_out_of_live_rooms() {
        let broadcaster = Arc::new(TestBroadcaster::default());
        let presence = presence(Duration::from_millis(20));
        let svc = service(presence.clone(), broadcaster, false);
        svc.create_room(create("lobby", true, None)).await.unwrap();

        // Session joins, then disconnects uncleanly: membership persists but
        // no broadcast group entry and, after the TTL, no presence either.
        connect(&presence, "token-x", "t9", "xavier").await;
        svc.add_member("lobby", "xavier", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let live = svc.list_live_rooms().await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(!live[0].observed_live);
        assert!(live[0].live_members.is_empty());
        // The persisted membership itself is still there.
        assert_eq!(live[0].room.members, vec!["xavier".to_string()]);
    }
}
