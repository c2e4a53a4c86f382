use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tether_models::gateway::{is_reserved_event, ROOM_SCOPE_FIELD};

use crate::broadcast::Broadcaster;
use crate::error::CoreError;
use crate::registry::SubscriptionRegistry;
use crate::validate::{validate_payload, FieldError};

/// Who emitted the event, as resolved by the gatekeeper.
#[derive(Debug, Clone)]
pub struct EmitContext {
    pub transport_id: String,
    /// The sender's stable identifier, stamped onto every outbound payload.
    pub sender_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    /// A dedicated handler owns this event name; nothing was done here.
    Deferred,
    /// No subscription for this name. Expected noise, not an error.
    NoSubscriber,
    /// Consumed server-side (`replicable = false`), no broadcast.
    Accepted,
    Delivered,
    Invalid,
    Failed,
}

/// The reply sent back over the event's callback channel, when one was
/// supplied. Routing never throws past this boundary.
#[derive(Debug, Clone, Serialize)]
pub struct RouteReply {
    pub status: RouteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

impl RouteReply {
    fn plain(status: RouteStatus, message: &str) -> Self {
        Self {
            status,
            message: Some(message.to_string()),
            errors: None,
            subscription_id: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "status": "failed" }))
    }
}

/// Dispatches client-emitted events through the subscription table:
/// resolve, validate, decide replication scope, broadcast.
pub struct EventRouter {
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl EventRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
        }
    }

    /// Route one inbound event. Infallible by contract: internal errors
    /// collapse into a generic `failed` reply instead of crossing the
    /// handler boundary.
    pub async fn route(&self, ctx: &EmitContext, event: &str, payload: &Value) -> RouteReply {
        match self.dispatch(ctx, event, payload).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(event, error = %e, "event dispatch failed");
                RouteReply::plain(RouteStatus::Failed, "processing failed")
            }
        }
    }

    async fn dispatch(
        &self,
        ctx: &EmitContext,
        event: &str,
        payload: &Value,
    ) -> Result<RouteReply, CoreError> {
        if is_reserved_event(event) {
            return Ok(RouteReply::plain(
                RouteStatus::Deferred,
                "handled by a dedicated handler",
            ));
        }

        let Some(sub) = self.registry.get_by_event_name(event) else {
            tracing::debug!(event, "no subscriber for event");
            return Ok(RouteReply::plain(RouteStatus::NoSubscriber, "no subscriber"));
        };

        if !sub.replicable {
            return Ok(RouteReply {
                status: RouteStatus::Accepted,
                message: Some("consumed".into()),
                errors: None,
                subscription_id: Some(sub.id),
            });
        }

        let data = match &sub.parameters {
            Some(specs) => match validate_payload(specs, payload) {
                Ok(clean) => clean,
                Err(errors) => {
                    return Ok(RouteReply {
                        status: RouteStatus::Invalid,
                        message: Some("validation failed".into()),
                        errors: Some(errors),
                        subscription_id: Some(sub.id),
                    });
                }
            },
            // Schema-less subscription: pass the object through unchanged.
            None => payload.as_object().cloned().unwrap_or_default(),
        };

        let mut outbound = data;
        outbound.insert("sender".into(), json!(ctx.sender_id));
        outbound.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        outbound.insert("subscription_id".into(), json!(sub.id));
        let outbound = Value::Object(outbound);

        let except = if sub.include_sender {
            None
        } else {
            Some(ctx.transport_id.as_str())
        };

        // Exactly one of the two scopes fires.
        let message = match payload.get(ROOM_SCOPE_FIELD).and_then(|v| v.as_str()) {
            Some(room_id) => {
                self.broadcaster
                    .emit_to_group(room_id, event, &outbound, except)
                    .await;
                format!("delivered to room '{room_id}'")
            }
            None => {
                self.broadcaster.emit_to_all(event, &outbound, except).await;
                "broadcast to all sessions".to_string()
            }
        };

        Ok(RouteReply {
            status: RouteStatus::Delivered,
            message: Some(message),
            errors: None,
            subscription_id: Some(sub.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewSubscription;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tether_models::{ParameterKind, ParameterSpec};

    #[derive(Debug, Clone)]
    struct Emission {
        group: Option<String>,
        event: String,
        data: Value,
        except: Option<String>,
    }

    #[derive(Default)]
    struct RecordingBroadcaster {
        emissions: Mutex<Vec<Emission>>,
    }

    impl RecordingBroadcaster {
        fn emissions(&self) -> Vec<Emission> {
            self.emissions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn join_group(&self, _transport_id: &str, _group: &str) {}
        async fn leave_group(&self, _transport_id: &str, _group: &str) {}
        async fn emit_to_group(&self, group: &str, event: &str, data: &Value, except: Option<&str>) {
            self.emissions.lock().unwrap().push(Emission {
                group: Some(group.to_string()),
                event: event.to_string(),
                data: data.clone(),
                except: except.map(str::to_string),
            });
        }
        async fn emit_to_all(&self, event: &str, data: &Value, except: Option<&str>) {
            self.emissions.lock().unwrap().push(Emission {
                group: None,
                event: event.to_string(),
                data: data.clone(),
                except: except.map(str::to_string),
            });
        }
        async fn group_members(&self, _group: &str) -> Vec<String> {
            Vec::new()
        }
    }

    fn harness() -> (Arc<SubscriptionRegistry>, Arc<RecordingBroadcaster>, EventRouter) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let router = EventRouter::new(registry.clone(), broadcaster.clone());
        (registry, broadcaster, router)
    }

    fn ctx() -> EmitContext {
        EmitContext {
            transport_id: "t1".into(),
            sender_id: "alice".into(),
        }
    }

    #[tokio::test]
    async fn reserved_events_are_deferred() {
        let (_, broadcaster, router) = harness();
        let reply = router.route(&ctx(), "join-room", &json!({})).await;
        assert_eq!(reply.status, RouteStatus::Deferred);
        assert!(broadcaster.emissions().is_empty());
    }

    #[tokio::test]
    async fn unknown_events_reply_no_subscriber() {
        let (_, broadcaster, router) = harness();
        let reply = router.route(&ctx(), "mystery", &json!({"x": 1})).await;
        assert_eq!(reply.status, RouteStatus::NoSubscriber);
        assert!(broadcaster.emissions().is_empty());
    }

    #[tokio::test]
    async fn non_replicable_events_never_broadcast() {
        let (registry, broadcaster, router) = harness();
        registry
            .create(NewSubscription {
                event_name: "private-signal".into(),
                replicable: false,
                include_sender: false,
                description: None,
                parameters: None,
            })
            .unwrap();

        let reply = router
            .route(&ctx(), "private-signal", &json!({"secret": "x", "room_id": "lobby"}))
            .await;
        assert_eq!(reply.status, RouteStatus::Accepted);
        assert!(broadcaster.emissions().is_empty());
    }

    #[tokio::test]
    async fn validation_failure_aborts_routing_with_field_detail() {
        let (registry, broadcaster, router) = harness();
        let mut message = ParameterSpec::new("message", ParameterKind::String);
        message.required = true;
        registry
            .create(NewSubscription {
                event_name: "chat-message".into(),
                replicable: true,
                include_sender: false,
                description: None,
                parameters: Some(vec![message]),
            })
            .unwrap();

        let reply = router.route(&ctx(), "chat-message", &json!({})).await;
        assert_eq!(reply.status, RouteStatus::Invalid);
        let errors = reply.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].parameter, "message");
        assert!(broadcaster.emissions().is_empty());
    }

    #[tokio::test]
    async fn room_scoped_emit_excludes_the_sender_by_default() {
        let (registry, broadcaster, router) = harness();
        let mut message = ParameterSpec::new("message", ParameterKind::String);
        message.sanitize = true;
        registry
            .create(NewSubscription {
                event_name: "chat-message".into(),
                replicable: true,
                include_sender: false,
                description: None,
                parameters: Some(vec![message]),
            })
            .unwrap();

        let reply = router
            .route(
                &ctx(),
                "chat-message",
                &json!({"message": "hello", "room_id": "lobby"}),
            )
            .await;
        assert_eq!(reply.status, RouteStatus::Delivered);

        let emissions = broadcaster.emissions();
        assert_eq!(emissions.len(), 1);
        let emission = &emissions[0];
        assert_eq!(emission.group.as_deref(), Some("lobby"));
        assert_eq!(emission.except.as_deref(), Some("t1"));

        // Outbound payload: declared fields + sender + timestamp + id, and
        // nothing else (room_id was not a declared parameter).
        let data = emission.data.as_object().unwrap();
        assert_eq!(data.get("message").unwrap(), &json!("hello"));
        assert_eq!(data.get("sender").unwrap(), &json!("alice"));
        assert!(data.contains_key("timestamp"));
        assert!(data.contains_key("subscription_id"));
        assert!(!data.contains_key("room_id"));
    }

    #[tokio::test]
    async fn unscoped_emit_broadcasts_to_all_and_can_echo() {
        let (registry, broadcaster, router) = harness();
        registry
            .create(NewSubscription {
                event_name: "ping".into(),
                replicable: true,
                include_sender: true,
                description: None,
                parameters: None,
            })
            .unwrap();

        let reply = router.route(&ctx(), "ping", &json!({"n": 1})).await;
        assert_eq!(reply.status, RouteStatus::Delivered);

        let emissions = broadcaster.emissions();
        assert_eq!(emissions.len(), 1);
        assert!(emissions[0].group.is_none());
        assert!(emissions[0].except.is_none());
        assert_eq!(emissions[0].data.get("n").unwrap(), &json!(1));
    }
}
