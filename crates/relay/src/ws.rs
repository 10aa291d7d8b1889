// WebSocket session layer: one task per connection, driving the handshake,
// the steady-state frame loop, and teardown against the room registry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::broadcast,
    time::MissedTickBehavior,
};
use uuid::Uuid;

use crate::error::EngineError;
use crate::registry::RoomRegistry;
use crate::room::Room;

const ROOM_EVENT_BUFFER: usize = 64;

/// Membership notification published when a connection joins or leaves a
/// room. Consumed by embedders (user tracking, metrics) via
/// [`CollabState::subscribe_room_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEvent {
    pub room: String,
    pub subject: String,
    pub kind: RoomEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEventKind {
    Joined,
    Left,
}

#[derive(Clone)]
pub struct CollabState {
    inner: Arc<CollabStateInner>,
}

struct CollabStateInner {
    registry: RoomRegistry,
    events_tx: broadcast::Sender<RoomEvent>,
    ping_interval: Duration,
}

impl CollabState {
    pub fn new(registry: RoomRegistry, ping_interval: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(ROOM_EVENT_BUFFER);
        Self { inner: Arc::new(CollabStateInner { registry, events_tx, ping_interval }) }
    }

    pub fn router(self) -> Router {
        Router::new().route("/rooms/{room}", get(room_ws_route)).with_state(self)
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.inner.registry
    }

    pub fn subscribe_room_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Pre-warm a room outside the WebSocket path.
    pub async fn get_or_create_room(&self, room: &str, seed: Option<&str>) -> Arc<Room> {
        self.inner.registry.get_or_create(room, seed).await
    }

    /// Render a live room's text content.
    pub async fn room_text(&self, room: &str, name: &str) -> Result<String, EngineError> {
        Ok(self.inner.registry.get(room).await?.text_content(name).await)
    }

    fn publish_event(&self, event: RoomEvent) {
        let _ = self.inner.events_tx.send(event);
    }
}

pub async fn serve(listener: TcpListener, state: CollabState) -> Result<()> {
    axum::serve(listener, state.router())
        .await
        .context("collaboration websocket server failed")
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    /// Seed content applied when this connection creates the room.
    template: Option<String>,
    /// Caller identity reported in room events.
    user: Option<String>,
}

async fn room_ws_route(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<CollabState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room, params))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: CollabState,
    room_name: String,
    params: ConnectParams,
) {
    let conn_id = Uuid::new_v4();
    let subject = params.user.unwrap_or_else(|| "anonymous".to_string());

    let (room, mut frames_rx, handshake_frames) = state
        .inner
        .registry
        .get_or_create_and_bind(&room_name, conn_id, params.template.as_deref())
        .await;

    tracing::debug!(room = %room_name, conn = %conn_id, subject = %subject, "connection bound");
    state.publish_event(RoomEvent {
        room: room_name.clone(),
        subject: subject.clone(),
        kind: RoomEventKind::Joined,
    });

    let mut bound = true;
    for frame in handshake_frames {
        if socket.send(WsMessage::Binary(frame.into())).await.is_err() {
            bound = false;
            break;
        }
    }

    if bound {
        let mut ping_timer = tokio::time::interval(state.inner.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ping_timer.tick().await;
        let mut pong_received = true;

        loop {
            tokio::select! {
                incoming = socket.recv() => {
                    let Some(Ok(message)) = incoming else {
                        break;
                    };

                    match message {
                        WsMessage::Binary(payload) => {
                            match room.handle_frame(conn_id, payload.as_ref()).await {
                                Ok(replies) => {
                                    let mut send_failed = false;
                                    for reply in replies {
                                        if socket.send(WsMessage::Binary(reply.into())).await.is_err() {
                                            send_failed = true;
                                            break;
                                        }
                                    }
                                    if send_failed {
                                        break;
                                    }
                                }
                                Err(error) => {
                                    tracing::warn!(room = %room_name, conn = %conn_id, ?error, "dropping malformed frame");
                                }
                            }
                        }
                        WsMessage::Close(_) => break,
                        WsMessage::Ping(payload) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        WsMessage::Pong(_) => {
                            pong_received = true;
                        }
                        WsMessage::Text(_) => {}
                    }
                }
                outbound = frames_rx.recv() => {
                    match outbound {
                        Ok((origin, payload)) if origin != Some(conn_id) => {
                            if socket.send(WsMessage::Binary(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // A lagged replica has missed updates it can only
                            // recover with a fresh handshake.
                            tracing::warn!(room = %room_name, conn = %conn_id, skipped, "connection lagged behind room fan-out, closing");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ping_timer.tick() => {
                    if !pong_received {
                        tracing::debug!(room = %room_name, conn = %conn_id, "connection failed liveness check");
                        break;
                    }
                    pong_received = false;
                    if socket.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    room.unbind(conn_id).await;
    state.publish_event(RoomEvent {
        room: room_name.clone(),
        subject,
        kind: RoomEventKind::Left,
    });
    state.inner.registry.release_if_empty(&room_name).await;
    tracing::debug!(room = %room_name, conn = %conn_id, "connection closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CollabState, RoomEvent, RoomEventKind};
    use crate::registry::{RegistrySettings, RoomRegistry};

    fn test_state() -> CollabState {
        let registry = RoomRegistry::new(None, RegistrySettings::default());
        CollabState::new(registry, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn room_events_reach_subscribers() {
        let state = test_state();
        let mut events = state.subscribe_room_events();

        state.publish_event(RoomEvent {
            room: "alpha".into(),
            subject: "alice".into(),
            kind: RoomEventKind::Joined,
        });

        let event = events.recv().await.expect("event should be delivered");
        assert_eq!(event.room, "alpha");
        assert_eq!(event.subject, "alice");
        assert_eq!(event.kind, RoomEventKind::Joined);
    }

    #[tokio::test]
    async fn prewarmed_room_is_visible_through_room_text() {
        let state = test_state();
        state.get_or_create_room("alpha", Some("warm start")).await;

        let text = state.room_text("alpha", "").await.expect("room should exist");
        assert_eq!(text, "warm start");
    }

    #[tokio::test]
    async fn room_text_fails_for_unknown_room() {
        let state = test_state();
        assert!(state.room_text("ghost", "").await.is_err());
    }
}
