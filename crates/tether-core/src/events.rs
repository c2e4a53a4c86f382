use chrono::Utc;
use tether_models::notify::{PresenceChange, PresenceNotification};
use tether_models::SessionRecord;
use tokio::sync::broadcast;

/// Broadcast-based notification stream for observability collaborators.
#[derive(Clone)]
pub struct NotifyBus {
    sender: broadcast::Sender<PresenceNotification>,
}

impl NotifyBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, notification: PresenceNotification) {
        // Ignore error if no receivers
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceNotification> {
        self.sender.subscribe()
    }

    pub fn presence(&self, change: PresenceChange, record: &SessionRecord, stable_key: &str) {
        self.publish(PresenceNotification {
            change,
            token_hash: record.token_hash.clone(),
            transport_id: record.transport_id.clone(),
            stable_id: record.identifier(stable_key),
            at: Utc::now(),
        });
    }
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
