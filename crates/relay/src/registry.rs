// Room registry: lazy creation, hydration, and empty-room teardown.
//
// The registry map sits behind one async mutex that stays held across
// hydration on create and across the flush on release. That makes creation
// the only place a room can come into existence (two racing connections get
// the same instance) and guarantees a flush finishes before the same room
// can be rehydrated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{sleep_until, Instant};

use crate::error::EngineError;
use crate::room::{ConnId, Room, RoomFrame};
use crate::storage::Storage;

/// Tuning knobs shared by every room the registry creates.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Capacity of each room's broadcast channel.
    pub broadcast_capacity: usize,
    /// Quiet period before queued updates are written out.
    pub persist_debounce: Duration,
    /// Upper bound on how long a queued update may wait under sustained
    /// editing.
    pub persist_max_wait: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            persist_debounce: Duration::from_millis(2000),
            persist_max_wait: Duration::from_millis(10_000),
        }
    }
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    storage: Option<Arc<dyn Storage>>,
    settings: RegistrySettings,
}

impl RoomRegistry {
    pub fn new(storage: Option<Arc<dyn Storage>>, settings: RegistrySettings) -> Self {
        Self { rooms: Mutex::new(HashMap::new()), storage, settings }
    }

    /// Fetch a room, creating it on first reference.
    ///
    /// A fresh room is hydrated from storage when a persisted state exists;
    /// otherwise the optional seed content is applied. Hydration failures log
    /// and fall back to an empty document rather than blocking creation.
    pub async fn get_or_create(&self, name: &str, seed: Option<&str>) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        self.resolve(&mut rooms, name, seed).await
    }

    /// Fetch a room and bind a connection to it in one registry critical
    /// section. A concurrent [`release_if_empty`](Self::release_if_empty)
    /// cannot run between resolution and bind, so the joining connection
    /// always lands on the replica the registry tracks.
    pub async fn get_or_create_and_bind(
        &self,
        name: &str,
        conn: ConnId,
        seed: Option<&str>,
    ) -> (Arc<Room>, broadcast::Receiver<RoomFrame>, Vec<Vec<u8>>) {
        let mut rooms = self.rooms.lock().await;
        let room = self.resolve(&mut rooms, name, seed).await;
        let (frames_rx, handshake_frames) = room.bind(conn).await;
        (room, frames_rx, handshake_frames)
    }

    async fn resolve(
        &self,
        rooms: &mut HashMap<String, Arc<Room>>,
        name: &str,
        seed: Option<&str>,
    ) -> Arc<Room> {
        if let Some(room) = rooms.get(name) {
            return Arc::clone(room);
        }

        let persist_tx = self.storage.as_ref().map(|storage| {
            let (persist_tx, persist_rx) = mpsc::unbounded_channel();
            spawn_persist_writer(
                name.to_string(),
                Arc::clone(storage),
                persist_rx,
                self.settings.persist_debounce,
                self.settings.persist_max_wait,
            );
            persist_tx
        });

        let room = Arc::new(Room::new(name, self.settings.broadcast_capacity, persist_tx));

        let mut hydrated = false;
        if let Some(storage) = &self.storage {
            match storage.hydrate(name).await {
                Ok(Some(state)) => match room.apply_state(&state).await {
                    Ok(()) => hydrated = true,
                    Err(error) => {
                        tracing::error!(room = name, ?error, "persisted state failed to apply, starting empty");
                    }
                },
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(room = name, ?error, "failed to hydrate room, starting empty");
                }
            }
        }

        if !hydrated {
            if let Some(content) = seed {
                room.seed(content).await;
            }
        }

        tracing::debug!(room = name, hydrated, "created room");
        rooms.insert(name.to_string(), Arc::clone(&room));
        room
    }

    /// Look up an existing room without creating it.
    pub async fn get(&self, name: &str) -> Result<Arc<Room>, EngineError> {
        self.rooms
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::RoomNotFound(name.to_string()))
    }

    /// Tear the room down if no connection is bound to it, flushing its full
    /// state through storage first. A flush failure is logged but does not
    /// keep the room alive.
    pub async fn release_if_empty(&self, name: &str) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(name) else {
            return;
        };
        if room.conn_count().await > 0 {
            return;
        }

        if let Some(storage) = &self.storage {
            let state = room.encode_state().await;
            if let Err(error) = storage.flush(name, &state).await {
                tracing::error!(room = name, ?error, "failed to flush room state during teardown");
            }
        }

        rooms.remove(name);
        tracing::debug!(room = name, "released empty room");
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Per-room writer that drains the update queue, coalescing bursts: a batch
/// is written after `debounce` of quiet, or once the oldest queued update has
/// waited `max_wait`. The task ends when the room (the only sender) drops.
fn spawn_persist_writer(
    room: String,
    storage: Arc<dyn Storage>,
    mut updates_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    debounce: Duration,
    max_wait: Duration,
) {
    tokio::spawn(async move {
        while let Some(first) = updates_rx.recv().await {
            let mut pending = vec![first];
            let deadline = Instant::now() + max_wait;

            loop {
                let wake = (Instant::now() + debounce).min(deadline);
                tokio::select! {
                    _ = sleep_until(wake) => break,
                    next = updates_rx.recv() => match next {
                        Some(update) => pending.push(update),
                        None => break,
                    },
                }
            }

            for update in pending {
                if let Err(error) = storage.store_update(&room, &update).await {
                    tracing::error!(room = %room, ?error, "failed to persist document update");
                }
            }
        }
    });
}
