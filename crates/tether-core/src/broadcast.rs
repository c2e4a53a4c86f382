use async_trait::async_trait;
use serde_json::Value;

/// The room-scoped broadcast primitives the transport layer provides. The
/// room store and event router depend on this capability only, never on a
/// socket library.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn join_group(&self, transport_id: &str, group: &str);

    async fn leave_group(&self, transport_id: &str, group: &str);

    /// Emit an event to every connection in a group, optionally excluding
    /// one transport (the sender, unless the subscription echoes).
    async fn emit_to_group(&self, group: &str, event: &str, data: &Value, except: Option<&str>);

    async fn emit_to_all(&self, event: &str, data: &Value, except: Option<&str>);

    /// Transport ids currently joined to a group.
    async fn group_members(&self, group: &str) -> Vec<String>;
}
