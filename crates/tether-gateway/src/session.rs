use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tether_core::Broadcaster;
use tether_models::gateway::ServerFrame;
use tokio::sync::mpsc;

/// Writer handle for one live connection. Frames are queued onto the
/// connection's outbound channel; the writer task owns the socket half.
pub struct ConnectionHandle {
    pub transport_id: String,
    pub stable_id: String,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

impl ConnectionHandle {
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// All live connections of this process plus their broadcast groups.
/// Implements the `Broadcaster` capability the core depends on.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
    groups: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        transport_id: String,
        stable_id: String,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) {
        self.connections.insert(
            transport_id.clone(),
            ConnectionHandle {
                transport_id,
                stable_id,
                sender,
            },
        );
    }

    pub fn unregister(&self, transport_id: &str) {
        self.connections.remove(transport_id);
        self.detach_from_groups(transport_id);
    }

    /// Close a connection from the server side: an error frame, then the
    /// outbound channel drops, which closes the socket.
    pub fn kick(&self, transport_id: &str, reason: &str) {
        if let Some((_, handle)) = self.connections.remove(transport_id) {
            handle.send(ServerFrame::Error {
                code: "connection_closed".into(),
                message: reason.into(),
            });
        }
        self.detach_from_groups(transport_id);
    }

    pub fn send_to(&self, transport_id: &str, frame: ServerFrame) -> bool {
        self.connections
            .get(transport_id)
            .map(|handle| handle.send(frame))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_registered(&self, transport_id: &str) -> bool {
        self.connections.contains_key(transport_id)
    }

    fn detach_from_groups(&self, transport_id: &str) {
        let group_names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        for name in group_names {
            self.groups.remove_if_mut(&name, |_, members| {
                members.remove(transport_id);
                members.is_empty()
            });
        }
    }
}

#[async_trait]
impl Broadcaster for ConnectionRegistry {
    async fn join_group(&self, transport_id: &str, group: &str) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(transport_id.to_string());
    }

    async fn leave_group(&self, transport_id: &str, group: &str) {
        self.groups.remove_if_mut(group, |_, members| {
            members.remove(transport_id);
            members.is_empty()
        });
    }

    async fn emit_to_group(&self, group: &str, event: &str, data: &Value, except: Option<&str>) {
        let members: Vec<String> = self
            .groups
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        for transport_id in members {
            if Some(transport_id.as_str()) == except {
                continue;
            }
            self.send_to(
                &transport_id,
                ServerFrame::Event {
                    event: event.to_string(),
                    data: data.clone(),
                },
            );
        }
    }

    async fn emit_to_all(&self, event: &str, data: &Value, except: Option<&str>) {
        let transports: Vec<String> = self
            .connections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for transport_id in transports {
            if Some(transport_id.as_str()) == except {
                continue;
            }
            self.send_to(
                &transport_id,
                ServerFrame::Event {
                    event: event.to_string(),
                    data: data.clone(),
                },
            );
        }
    }

    async fn group_members(&self, group: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .groups
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }
}
