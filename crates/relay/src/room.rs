// A single collaborative document and its bound connections.
//
// All document and presence state sits behind one async mutex, which is the
// per-room serialization point: updates are applied and published in a single
// critical section, so every subscriber observes them in application order.
// Fan-out happens over a broadcast channel carrying encoded wire frames
// tagged with their origin connection.

use std::collections::{HashMap, HashSet};

use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;
use yrs::sync::{DefaultProtocol, Message, Protocol, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::error::EngineError;
use crate::presence::PresenceTracker;
use crate::protocol;

pub type ConnId = Uuid;

/// Encoded wire frame published to room subscribers. Frames with
/// `origin == None` are delivered to every bound connection, including the
/// one that caused them; `origin == Some(conn)` frames are skipped by that
/// connection.
pub type RoomFrame = (Option<ConnId>, Vec<u8>);

pub struct Room {
    name: String,
    state: Mutex<RoomState>,
    frames_tx: broadcast::Sender<RoomFrame>,
    persist_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

struct RoomState {
    presence: PresenceTracker,
    /// Bound connections and the presence ids each one controls.
    conns: HashMap<ConnId, HashSet<u64>>,
}

impl Room {
    pub fn new(
        name: impl Into<String>,
        broadcast_capacity: usize,
        persist_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    ) -> Self {
        let (frames_tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            name: name.into(),
            state: Mutex::new(RoomState {
                presence: PresenceTracker::new(Doc::new()),
                conns: HashMap::new(),
            }),
            frames_tx,
            persist_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a connection and return its broadcast receiver together with
    /// the handshake frames to send it: a sync step-1 request built from the
    /// current state vector, plus a presence snapshot when the room has live
    /// presence. Subscribing under the room lock guarantees the connection
    /// misses no frame published after its step-1.
    pub async fn bind(&self, conn: ConnId) -> (broadcast::Receiver<RoomFrame>, Vec<Vec<u8>>) {
        let mut state = self.state.lock().await;
        state.conns.insert(conn, HashSet::new());
        let frames_rx = self.frames_tx.subscribe();

        let mut frames = Vec::new();
        let state_vector = state.presence.doc().transact().state_vector();
        frames.push(protocol::sync_step1(state_vector));

        match state.presence.snapshot() {
            Ok(Some(snapshot)) => frames.push(protocol::awareness(snapshot)),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(room = %self.name, %conn, ?error, "failed to encode presence snapshot");
            }
        }

        (frames_rx, frames)
    }

    /// Process one inbound transport frame from a bound connection.
    ///
    /// Returns the direct replies to send back on that connection. Document
    /// updates are applied and broadcast to everyone (the sender included);
    /// presence deltas are rebroadcast to every other connection. A frame
    /// that fails to decode is dropped whole; a decoded message that fails to
    /// apply is dropped alone and replies for the frame's other messages
    /// still go out. Either way the connection stays open.
    pub async fn handle_frame(
        &self,
        conn: ConnId,
        payload: &[u8],
    ) -> Result<Vec<Vec<u8>>, EngineError> {
        let mut replies = Vec::new();

        let mut state = self.state.lock().await;
        for message in protocol::decode_frames(payload)? {
            // A message that fails to apply is dropped on its own; replies
            // already computed for the rest of the frame still go out.
            if let Err(error) = self.apply_message(&mut state, conn, message, &mut replies) {
                tracing::warn!(room = %self.name, %conn, ?error, "dropping unappliable message");
            }
        }

        Ok(replies)
    }

    fn apply_message(
        &self,
        state: &mut RoomState,
        conn: ConnId,
        message: Message,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let sync_protocol = DefaultProtocol;
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                if let Some(reply) =
                    sync_protocol.handle_sync_step1(state.presence.awareness(), state_vector)?
                {
                    replies.push(reply.encode_v1());
                }
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                let decoded = Update::decode_v1(&update)
                    .map_err(|error| EngineError::InvalidUpdate(error.to_string()))?;
                sync_protocol.handle_sync_step2(state.presence.awareness(), decoded)?;
                self.notify_update(update);
            }
            Message::Sync(SyncMessage::Update(update)) => {
                let decoded = Update::decode_v1(&update)
                    .map_err(|error| EngineError::InvalidUpdate(error.to_string()))?;
                sync_protocol.handle_update(state.presence.awareness(), decoded)?;
                self.notify_update(update);
            }
            Message::Awareness(update) => {
                if let Some(change) = state.presence.apply(update)? {
                    if let Some(controlled) = state.conns.get_mut(&conn) {
                        for id in &change.added {
                            controlled.insert(*id);
                        }
                        for id in &change.removed {
                            controlled.remove(id);
                        }
                    }
                    let _ =
                        self.frames_tx.send((Some(conn), protocol::awareness(change.delta)));
                }
            }
            Message::AwarenessQuery => {
                if let Some(snapshot) = state.presence.snapshot()? {
                    replies.push(protocol::awareness(snapshot));
                }
            }
            other => {
                if let Some(reply) =
                    sync_protocol.handle_message(state.presence.awareness(), other)?
                {
                    replies.push(reply.encode_v1());
                }
            }
        }

        Ok(())
    }

    /// Unregister a connection, broadcasting one removal delta for every
    /// presence id it controlled. Returns true when the room is now empty.
    pub async fn unbind(&self, conn: ConnId) -> bool {
        let mut state = self.state.lock().await;
        let controlled = state.conns.remove(&conn).unwrap_or_default();

        if !controlled.is_empty() {
            let ids: Vec<u64> = controlled.into_iter().collect();
            match state.presence.clear(&ids) {
                Ok(Some(delta)) => {
                    let _ = self.frames_tx.send((Some(conn), protocol::awareness(delta)));
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(room = %self.name, %conn, ?error, "failed to encode presence removal");
                }
            }
        }

        state.conns.is_empty()
    }

    /// Insert initial content into the root text. Only meaningful on a fresh
    /// room, before any connection binds.
    pub async fn seed(&self, content: &str) {
        let state = self.state.lock().await;
        let text = state.presence.doc().get_or_insert_text("");
        let mut txn = state.presence.doc().transact_mut();
        text.push(&mut txn, content);
    }

    /// Apply a previously flushed full-state update during hydration.
    pub async fn apply_state(&self, update: &[u8]) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        let decoded = Update::decode_v1(update)
            .map_err(|error| EngineError::InvalidUpdate(error.to_string()))?;
        DefaultProtocol.handle_update(state.presence.awareness(), decoded)?;
        Ok(())
    }

    /// Encode the full document state for the flush path.
    pub async fn encode_state(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let txn = state.presence.doc().transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Render the named root text ("" is the default root).
    pub async fn text_content(&self, name: &str) -> String {
        let state = self.state.lock().await;
        let txn = state.presence.doc().transact();
        txn.get_text(name).map(|text| text.get_string(&txn)).unwrap_or_default()
    }

    pub async fn conn_count(&self) -> usize {
        self.state.lock().await.conns.len()
    }

    pub async fn presence_count(&self) -> usize {
        self.state.lock().await.presence.live_count()
    }

    /// Publish an applied document update: fan it out to every bound
    /// connection and queue it for the persistence writer. Called with the
    /// room lock held so publication order matches application order.
    fn notify_update(&self, update: Vec<u8>) {
        if let Some(persist_tx) = &self.persist_tx {
            let _ = persist_tx.send(update.clone());
        }
        let _ = self.frames_tx.send((None, protocol::sync_update(update)));
    }
}

#[cfg(test)]
mod tests {
    use super::{Room, RoomFrame};
    use crate::protocol::{self, MSG_AWARENESS, MSG_SYNC};
    use tokio::sync::broadcast;
    use uuid::Uuid;
    use yrs::sync::{Awareness, DefaultProtocol, Message, Protocol, SyncMessage};
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact};

    fn test_room() -> Room {
        Room::new("test-room", 16, None)
    }

    fn client_update(client_id: u64, content: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(client_id);
        let text = doc.get_or_insert_text("");
        let mut txn = doc.transact_mut();
        text.push(&mut txn, content);
        txn.encode_update_v1()
    }

    fn peer_awareness_frame(client_id: u64, name: &str) -> Vec<u8> {
        let awareness = Awareness::new(Doc::with_client_id(client_id));
        awareness
            .set_local_state(serde_json::json!({ "user": name }))
            .expect("peer state should serialize");
        protocol::awareness(awareness.update().expect("peer update should encode"))
    }

    fn recv_now(rx: &mut broadcast::Receiver<RoomFrame>) -> RoomFrame {
        rx.try_recv().expect("expected a broadcast frame")
    }

    #[tokio::test]
    async fn bind_sends_step1_without_presence_snapshot() {
        let room = test_room();
        let (_rx, frames) = room.bind(Uuid::new_v4()).await;

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], MSG_SYNC);
    }

    #[tokio::test]
    async fn bind_includes_presence_snapshot_when_room_has_presence() {
        let room = test_room();
        let first = Uuid::new_v4();
        let (_rx, _) = room.bind(first).await;
        room.handle_frame(first, &peer_awareness_frame(7, "alice"))
            .await
            .expect("presence frame should apply");

        let (_rx2, frames) = room.bind(Uuid::new_v4()).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], MSG_SYNC);
        assert_eq!(frames[1][0], MSG_AWARENESS);
    }

    #[tokio::test]
    async fn step1_gets_a_direct_step2_reply() {
        let room = test_room();
        room.seed("hello").await;
        let conn = Uuid::new_v4();
        let (_rx, _) = room.bind(conn).await;

        let client = Awareness::new(Doc::with_client_id(1));
        let step1 = protocol::sync_step1(client.doc().transact().state_vector());
        let replies =
            room.handle_frame(conn, &step1).await.expect("step1 should produce a reply");

        assert_eq!(replies.len(), 1);
        let responses = DefaultProtocol
            .handle(&client, &replies[0])
            .expect("client should apply step2 reply");
        assert!(responses.is_empty());

        let txn = client.doc().transact();
        let content =
            txn.get_text("").map(|text| text.get_string(&txn)).unwrap_or_default();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn update_is_applied_and_broadcast_to_everyone() {
        let room = test_room();
        let conn_a = Uuid::new_v4();
        let (mut rx_a, _) = room.bind(conn_a).await;
        let (mut rx_b, _) = room.bind(Uuid::new_v4()).await;

        let update = client_update(1, "from-a");
        let replies = room
            .handle_frame(conn_a, &protocol::sync_update(update.clone()))
            .await
            .expect("update frame should apply");
        assert!(replies.is_empty());
        assert_eq!(room.text_content("").await, "from-a");

        // Everyone gets the frame, the originator included.
        let (origin, frame) = recv_now(&mut rx_a);
        assert_eq!(origin, None);
        assert_eq!(frame, protocol::sync_update(update));
        let (origin, _) = recv_now(&mut rx_b);
        assert_eq!(origin, None);
    }

    #[tokio::test]
    async fn presence_delta_is_rebroadcast_tagged_with_its_origin() {
        let room = test_room();
        let conn_a = Uuid::new_v4();
        let (mut rx_a, _) = room.bind(conn_a).await;

        room.handle_frame(conn_a, &peer_awareness_frame(7, "alice"))
            .await
            .expect("presence frame should apply");

        let (origin, frame) = recv_now(&mut rx_a);
        assert_eq!(origin, Some(conn_a));
        assert_eq!(frame[0], MSG_AWARENESS);
        assert_eq!(room.presence_count().await, 1);
    }

    #[tokio::test]
    async fn stale_presence_delta_is_not_rebroadcast() {
        let room = test_room();
        let conn = Uuid::new_v4();
        let (mut rx, _) = room.bind(conn).await;
        let frame = peer_awareness_frame(7, "alice");

        room.handle_frame(conn, &frame).await.expect("first presence frame should apply");
        let _ = recv_now(&mut rx);
        room.handle_frame(conn, &frame).await.expect("replayed presence frame should apply");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unbind_clears_controlled_presence_with_one_delta() {
        let room = test_room();
        let conn_a = Uuid::new_v4();
        let (_rx_a, _) = room.bind(conn_a).await;
        let (mut rx_b, _) = room.bind(Uuid::new_v4()).await;

        room.handle_frame(conn_a, &peer_awareness_frame(7, "alice"))
            .await
            .expect("presence frame should apply");
        let _ = recv_now(&mut rx_b);

        let empty = room.unbind(conn_a).await;
        assert!(!empty);
        assert_eq!(room.presence_count().await, 0);

        let (origin, frame) = recv_now(&mut rx_b);
        assert_eq!(origin, Some(conn_a));
        assert_eq!(frame[0], MSG_AWARENESS);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unbind_reports_when_room_becomes_empty() {
        let room = test_room();
        let conn = Uuid::new_v4();
        room.bind(conn).await;
        assert!(room.unbind(conn).await);
    }

    #[tokio::test]
    async fn packed_frame_answers_step1_even_when_a_later_message_is_bad() {
        let room = test_room();
        room.seed("hello").await;
        let conn = Uuid::new_v4();
        room.bind(conn).await;

        let client = Awareness::new(Doc::with_client_id(1));
        let mut frame = protocol::sync_step1(client.doc().transact().state_vector());
        // An update whose payload is an unterminated varint cannot decode.
        frame.extend_from_slice(&protocol::sync_update(vec![0xff, 0xff, 0xff, 0xff]));

        let replies = room
            .handle_frame(conn, &frame)
            .await
            .expect("frame with one bad message should still produce replies");

        assert_eq!(replies.len(), 1);
        DefaultProtocol
            .handle(&client, &replies[0])
            .expect("client should apply step2 reply");
        let txn = client.doc().transact();
        let content = txn.get_text("").map(|text| text.get_string(&txn)).unwrap_or_default();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn malformed_frame_is_an_error_not_a_panic() {
        let room = test_room();
        let conn = Uuid::new_v4();
        room.bind(conn).await;

        assert!(room.handle_frame(conn, &[42]).await.is_err());
        // The room is still usable afterwards.
        room.seed("still alive").await;
        assert_eq!(room.text_content("").await, "still alive");
    }

    #[tokio::test]
    async fn persist_queue_receives_raw_updates() {
        let (persist_tx, mut persist_rx) = tokio::sync::mpsc::unbounded_channel();
        let room = Room::new("persisted", 16, Some(persist_tx));
        let conn = Uuid::new_v4();
        room.bind(conn).await;

        let update = client_update(1, "durable");
        room.handle_frame(conn, &protocol::sync_update(update.clone()))
            .await
            .expect("update frame should apply");

        assert_eq!(persist_rx.try_recv().expect("update should be queued"), update);
    }

    #[tokio::test]
    async fn step2_during_handshake_is_fanned_out_as_update() {
        let room = test_room();
        let conn = Uuid::new_v4();
        let (mut rx, _) = room.bind(conn).await;

        let update = client_update(1, "handshake edit");
        let frame = Message::Sync(SyncMessage::SyncStep2(update.clone())).encode_v1();
        room.handle_frame(conn, &frame).await.expect("step2 frame should apply");

        assert_eq!(room.text_content("").await, "handshake edit");
        let (origin, broadcast_frame) = recv_now(&mut rx);
        assert_eq!(origin, None);
        let messages =
            protocol::decode_frames(&broadcast_frame).expect("broadcast frame should decode");
        assert!(matches!(&messages[0], Message::Sync(SyncMessage::Update(u)) if *u == update));
    }

    #[tokio::test]
    async fn hydration_round_trips_through_encoded_state() {
        let source = test_room();
        source.seed("persisted text").await;
        let state = source.encode_state().await;

        let restored = test_room();
        restored.apply_state(&state).await.expect("flushed state should apply");
        assert_eq!(restored.text_content("").await, "persisted text");
    }
}
