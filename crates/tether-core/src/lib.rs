pub mod broadcast;
pub mod error;
pub mod events;
pub mod identity;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use tether_store::{PresenceBackend, RoomBackend};
use tokio::sync::Notify;

pub use broadcast::Broadcaster;
pub use error::CoreError;
pub use events::NotifyBus;
pub use identity::IdentityService;
pub use presence::PresenceDirectory;
pub use registry::SubscriptionRegistry;
pub use rooms::RoomService;
pub use router::EventRouter;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Key of the stable unique identifier inside the token's bag.
    pub stable_identifier_key: String,
    pub token_expiry_seconds: u64,
    /// Presence TTL; absence after expiry means disconnected.
    pub presence_ttl_seconds: u64,
    /// Per-token heartbeat period. Must stay well below the TTL.
    pub heartbeat_interval_seconds: u64,
    pub room_ttl_seconds: u64,
    /// Auto-create rooms on a client join when the room does not exist.
    pub auto_create_rooms: bool,
    /// How long a fresh connection may take to identify itself.
    pub identify_timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            stable_identifier_key: "id".to_string(),
            token_expiry_seconds: 86_400,
            presence_ttl_seconds: 60,
            heartbeat_interval_seconds: 20,
            room_ttl_seconds: 86_400,
            auto_create_rooms: true,
            identify_timeout_seconds: 30,
        }
    }
}

impl AppConfig {
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_seconds)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_secs(self.identify_timeout_seconds)
    }
}

/// Explicitly constructed service graph shared by the transport and HTTP
/// layers. No module-level singletons; everything is injected.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub identity: Arc<IdentityService>,
    pub presence: Arc<PresenceDirectory>,
    pub rooms: Arc<RoomService>,
    pub registry: Arc<SubscriptionRegistry>,
    pub router: Arc<EventRouter>,
    pub notify: NotifyBus,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    /// Wire the services together. `None` backends mean single-instance,
    /// in-process operation (tests, development without Redis).
    pub fn build(
        config: AppConfig,
        token_secret: String,
        presence_backend: Option<Arc<dyn PresenceBackend>>,
        room_backend: Option<Arc<dyn RoomBackend>>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let notify = NotifyBus::default();
        let identity = Arc::new(IdentityService::new(
            token_secret,
            config.token_expiry_seconds,
            config.stable_identifier_key.clone(),
        ));
        let presence = Arc::new(PresenceDirectory::new(
            presence_backend,
            config.stable_identifier_key.clone(),
            config.presence_ttl(),
            notify.clone(),
        ));
        let rooms = Arc::new(RoomService::new(
            room_backend,
            presence.clone(),
            broadcaster.clone(),
            config.room_ttl(),
            config.auto_create_rooms,
        ));
        let registry = Arc::new(SubscriptionRegistry::new());
        let router = Arc::new(EventRouter::new(registry.clone(), broadcaster.clone()));

        Self {
            config,
            identity,
            presence,
            rooms,
            registry,
            router,
            notify,
            broadcaster,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Start background work (presence sweeper / degraded-mode probe).
    pub fn start(&self) {
        self.presence.start();
    }

    /// Stop background work and wake anything waiting on shutdown.
    pub fn stop(&self) {
        self.presence.shutdown();
        self.shutdown.notify_waiters();
    }
}
