use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tether_core::router::EmitContext;
use tether_core::AppState;
use tether_models::gateway::{ClientFrame, ServerFrame};
use tether_models::SessionRecord;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::ConnectionRegistry;

const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Connection lifecycle: Connecting -> Authenticating -> Authenticated or
/// Rejected. A rejected connection never reaches the authenticated loop.
pub(crate) async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    connections: Arc<ConnectionRegistry>,
    query_token: Option<String>,
    header_token: Option<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Authenticating: wait for the identify frame, bounded.
    let identify = tokio::time::timeout(
        state.config.identify_timeout(),
        wait_for_identify(&mut ws_receiver),
    )
    .await;
    let Ok(Some((auth_token, resume))) = identify else {
        reject(&mut ws_sender, "unauthorized", "token required").await;
        return;
    };

    // Credential priority: auth payload, then query, then header.
    let token = match select_token(auth_token, query_token, header_token) {
        Some(token) => token,
        None => {
            reject(&mut ws_sender, "unauthorized", "token required").await;
            return;
        }
    };

    let verified = match state.identity.verify(&token) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "gateway connection rejected");
            reject(&mut ws_sender, "unauthorized", "invalid or expired token").await;
            return;
        }
    };

    // Authenticated: write presence, then wire the session up.
    let transport_id = uuid::Uuid::new_v4().to_string();
    let stable_id = verified.stable_id.clone();

    let recovered = if resume {
        state.presence.get(&token).await.unwrap_or_default()
    } else {
        None
    };

    let mut record = SessionRecord::new(String::new(), transport_id.clone(), verified.identifiers);
    if let Some(prev) = &recovered {
        record.connected_at = prev.connected_at;
        record.rooms = prev.rooms.clone();
    }

    let outcome = match state.presence.put(&token, record).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "presence write failed during connect");
            reject(&mut ws_sender, "internal", "presence unavailable").await;
            return;
        }
    };
    if let Some(displaced) = &outcome.displaced {
        // Same stable identifier reconnected under a new token; the old
        // socket (if it lives in this process) is closed right away.
        connections.kick(&displaced.transport_id, "session superseded by a new connection");
    }

    let (tx, rx) = mpsc::unbounded_channel::<ServerFrame>();
    connections.register(transport_id.clone(), stable_id.clone(), tx);
    // The writer owns the sink; it closes the socket once the handle drops.
    let _writer = spawn_writer(ws_sender, rx);

    // Reconnection Coordinator: rejoin recovered rooms, then acknowledge to
    // this session only.
    let mut joined_rooms: Vec<String> = Vec::new();
    if let Some(prev) = &recovered {
        for room_id in &prev.rooms {
            match state
                .rooms
                .add_member(room_id, &stable_id, Some(&transport_id))
                .await
            {
                Ok(result) if result.success => joined_rooms.push(room_id.clone()),
                Ok(result) => {
                    tracing::debug!(%room_id, message = %result.message, "room not rejoined on resume")
                }
                Err(e) => tracing::warn!(%room_id, error = %e, "room rejoin failed on resume"),
            }
        }
        let _ = state
            .presence
            .update_rooms(&token, joined_rooms.clone())
            .await;
        connections.send_to(
            &transport_id,
            ServerFrame::Reconnected {
                rooms: joined_rooms.clone(),
            },
        );
        tracing::info!(%transport_id, %stable_id, rooms = joined_rooms.len(), "session resumed");
    } else {
        connections.send_to(
            &transport_id,
            ServerFrame::Ready {
                transport_id: transport_id.clone(),
                heartbeat_interval_ms: state.config.heartbeat_interval().as_millis() as u64,
            },
        );
        tracing::info!(%transport_id, %stable_id, "session authenticated");
    }

    let heartbeat = spawn_heartbeat(
        state.clone(),
        connections.clone(),
        token.clone(),
        transport_id.clone(),
    );

    let ctx = EmitContext {
        transport_id: transport_id.clone(),
        sender_id: stable_id.clone(),
    };

    // Authenticated read loop.
    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                connections.send_to(
                    &transport_id,
                    ServerFrame::Error {
                        code: "bad_frame".into(),
                        message: format!("unreadable frame: {e}"),
                    },
                );
                continue;
            }
        };

        match frame {
            ClientFrame::Identify { .. } => {
                // Already authenticated; nothing to do.
            }
            ClientFrame::Heartbeat => {
                connections.send_to(&transport_id, ServerFrame::HeartbeatAck);
            }
            ClientFrame::JoinRoom { room_id } => {
                handle_join(
                    &state,
                    &connections,
                    &token,
                    &transport_id,
                    &stable_id,
                    &room_id,
                    &mut joined_rooms,
                )
                .await;
            }
            ClientFrame::LeaveRoom { room_id } => {
                handle_leave(
                    &state,
                    &connections,
                    &token,
                    &transport_id,
                    &stable_id,
                    &room_id,
                    &mut joined_rooms,
                )
                .await;
            }
            ClientFrame::Emit {
                event,
                data,
                callback_id,
            } => {
                let reply = state.router.route(&ctx, &event, &data).await;
                if let Some(callback_id) = callback_id {
                    connections.send_to(
                        &transport_id,
                        ServerFrame::Reply {
                            callback_id,
                            data: reply.to_value(),
                        },
                    );
                }
            }
        }

        // The server-side kick path removes the handle; once it is gone
        // this connection is done.
        if !connections.is_registered(&transport_id) {
            break;
        }
    }

    // Disconnect hook: cancel the heartbeat and clean up presence and room
    // memberships before returning. No detached fire-and-forget cleanup.
    heartbeat.abort();
    connections.unregister(&transport_id);

    let owns_record = match state.presence.get(&token).await {
        Ok(Some(current)) => current.transport_id == transport_id,
        _ => false,
    };
    if owns_record {
        if let Err(e) = state.presence.remove(&token).await {
            tracing::warn!(error = %e, "presence cleanup failed on disconnect");
        }
        for room_id in &joined_rooms {
            if let Err(e) = state.rooms.remove_member(room_id, &stable_id, true).await {
                tracing::warn!(%room_id, error = %e, "room cleanup failed on disconnect");
            }
        }
    }
    tracing::info!(%transport_id, %stable_id, "session disconnected");
}

/// Pick the credential the way the handshake priority dictates:
/// auth payload first, then the query string, then the header.
fn select_token(
    auth_token: Option<String>,
    query_token: Option<String>,
    header_token: Option<String>,
) -> Option<String> {
    auth_token
        .filter(|t| !t.is_empty())
        .or(query_token.filter(|t| !t.is_empty()))
        .or(header_token.filter(|t| !t.is_empty()))
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
) -> Option<(Option<String>, bool)> {
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => {
                if let Ok(ClientFrame::Identify { token, resume }) =
                    serde_json::from_str::<ClientFrame>(&text)
                {
                    return Some((token, resume));
                }
                // Anything else before identify is ignored.
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, code: &str, message: &str) {
    let frame = ServerFrame::Error {
        code: code.into(),
        message: message.into(),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = sender.send(Message::Text(text.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: message.to_string().into(),
        })))
        .await;
}

fn spawn_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    })
}

/// Per-token heartbeat: refreshes the presence TTL well inside its window.
/// When the record disappears (expired, or evicted by a reconnect on
/// another process) the connection is closed from here.
fn spawn_heartbeat(
    state: AppState,
    connections: Arc<ConnectionRegistry>,
    token: String,
    transport_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.heartbeat_interval());
        ticker.tick().await; // skip immediate first tick
        loop {
            ticker.tick().await;
            match state.presence.touch(&token).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(%transport_id, "presence record gone, closing connection");
                    connections.kick(&transport_id, "session expired or superseded");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "heartbeat refresh failed");
                }
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn handle_join(
    state: &AppState,
    connections: &ConnectionRegistry,
    token: &str,
    transport_id: &str,
    stable_id: &str,
    room_id: &str,
    joined_rooms: &mut Vec<String>,
) {
    let room = match state.rooms.ensure_room(room_id).await {
        Ok(Some(room)) => room,
        Ok(None) => {
            connections.send_to(
                transport_id,
                ServerFrame::Error {
                    code: "room_not_found".into(),
                    message: format!("room '{room_id}' does not exist"),
                },
            );
            return;
        }
        Err(e) => {
            tracing::warn!(room_id, error = %e, "room lookup failed");
            connections.send_to(
                transport_id,
                ServerFrame::Error {
                    code: "join_failed".into(),
                    message: "could not join room".into(),
                },
            );
            return;
        }
    };

    let check = match state.rooms.can_join(&room.id, stable_id).await {
        Ok(check) => check,
        Err(e) => {
            tracing::warn!(room_id, error = %e, "join check failed");
            connections.send_to(
                transport_id,
                ServerFrame::Error {
                    code: "join_failed".into(),
                    message: "could not join room".into(),
                },
            );
            return;
        }
    };
    if !check.can_join {
        connections.send_to(
            transport_id,
            ServerFrame::Error {
                code: "join_refused".into(),
                message: check.reason.unwrap_or_else(|| "join refused".into()),
            },
        );
        return;
    }

    match state
        .rooms
        .add_member(&room.id, stable_id, Some(transport_id))
        .await
    {
        Ok(result) if result.success => {
            if !joined_rooms.iter().any(|r| r == &room.id) {
                joined_rooms.push(room.id.clone());
            }
            let _ = state
                .presence
                .update_rooms(token, joined_rooms.clone())
                .await;
            connections.send_to(
                transport_id,
                ServerFrame::RoomJoined {
                    room_id: room.id.clone(),
                },
            );
        }
        Ok(result) => {
            connections.send_to(
                transport_id,
                ServerFrame::Error {
                    code: "join_refused".into(),
                    message: result.message,
                },
            );
        }
        Err(e) => {
            tracing::warn!(room_id, error = %e, "join failed");
            connections.send_to(
                transport_id,
                ServerFrame::Error {
                    code: "join_failed".into(),
                    message: "could not join room".into(),
                },
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_leave(
    state: &AppState,
    connections: &ConnectionRegistry,
    token: &str,
    transport_id: &str,
    stable_id: &str,
    room_id: &str,
    joined_rooms: &mut Vec<String>,
) {
    match state.rooms.remove_member(room_id, stable_id, false).await {
        Ok(result) if result.success => {
            joined_rooms.retain(|r| r != room_id);
            let _ = state
                .presence
                .update_rooms(token, joined_rooms.clone())
                .await;
            connections.send_to(
                transport_id,
                ServerFrame::RoomLeft {
                    room_id: room_id.to_string(),
                },
            );
        }
        Ok(result) => {
            connections.send_to(
                transport_id,
                ServerFrame::Error {
                    code: "leave_refused".into(),
                    message: result
                        .reason
                        .unwrap_or_else(|| "could not leave room".into()),
                },
            );
        }
        Err(e) => {
            tracing::warn!(room_id, error = %e, "leave failed");
            connections.send_to(
                transport_id,
                ServerFrame::Error {
                    code: "leave_failed".into(),
                    message: "could not leave room".into(),
                },
            );
        }
    }
}
