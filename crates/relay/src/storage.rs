// Durable persistence boundary.
//
// Concrete backends (database, object store, ...) live outside this crate;
// the engine only sees this trait. All payloads are opaque CRDT update blobs
// in the library's v1 binary encoding.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Persistence hooks for room state.
///
/// `hydrate` runs once when a room is created, `store_update` receives
/// debounced incremental updates while the room is live, and `flush` writes
/// the full document state when the last connection leaves.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load the previously flushed state for a room, if any.
    async fn hydrate(&self, room: &str) -> Result<Option<Vec<u8>>>;

    /// Record an incremental document update.
    async fn store_update(&self, room: &str, update: &[u8]) -> Result<()>;

    /// Write the full document state during room teardown.
    async fn flush(&self, room: &str, state: &[u8]) -> Result<()>;
}

/// In-memory adapter for tests and embedders that want persistence across
/// room teardown without a durable backend.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<HashMap<String, StoredRoom>>,
}

#[derive(Default)]
struct StoredRoom {
    state: Option<Vec<u8>>,
    updates: Vec<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last flushed state for a room, if any.
    pub async fn stored_state(&self, room: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.get(room).and_then(|stored| stored.state.clone())
    }

    /// Number of incremental updates recorded for a room.
    pub async fn update_count(&self, room: &str) -> usize {
        self.inner.lock().await.get(room).map(|stored| stored.updates.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn hydrate(&self, room: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.get(room).and_then(|stored| stored.state.clone()))
    }

    async fn store_update(&self, room: &str, update: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.entry(room.to_string()).or_default().updates.push(update.to_vec());
        Ok(())
    }

    async fn flush(&self, room: &str, state: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.entry(room.to_string()).or_default().state = Some(state.to_vec());
        Ok(())
    }
}
