// Presence (awareness) bookkeeping for a single room.
//
// Presence entries live in the awareness CRDT owned by the tracker; ids are
// the CRDT client ids and are treated as opaque values compared only for set
// membership. A presence id is "live" while its entry carries state data;
// removal leaves a tombstone with a bumped clock so late observers converge.

use yrs::sync::{Awareness, AwarenessUpdate};
use yrs::Doc;

use crate::error::EngineError;

/// Result of merging a presence delta: which ids appeared, changed state, or
/// went away, plus the re-encoded delta to fan out to other connections.
#[derive(Debug)]
pub struct PresenceChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
    pub delta: AwarenessUpdate,
}

pub struct PresenceTracker {
    awareness: Awareness,
}

impl PresenceTracker {
    pub fn new(doc: Doc) -> Self {
        Self { awareness: Awareness::new(doc) }
    }

    pub fn doc(&self) -> &Doc {
        self.awareness.doc()
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    /// Merge a remote presence delta.
    ///
    /// Returns `None` when the delta was stale (no entry actually changed),
    /// in which case nothing should be rebroadcast.
    pub fn apply(&self, update: AwarenessUpdate) -> Result<Option<PresenceChange>, EngineError> {
        let Some(summary) = self
            .awareness
            .apply_update_summary(update)
            .map_err(|error| EngineError::Presence(error.to_string()))?
        else {
            return Ok(None);
        };

        let added = summary.added.clone();
        let updated = summary.updated.clone();
        let removed = summary.removed.clone();
        let changed = summary.all_changes();
        if changed.is_empty() {
            return Ok(None);
        }

        let delta = self
            .awareness
            .update_with_clients(changed)
            .map_err(|error| EngineError::Presence(error.to_string()))?;
        Ok(Some(PresenceChange { added, updated, removed, delta }))
    }

    /// Encode a snapshot of every live presence entry, or `None` when the
    /// room has no live presence.
    pub fn snapshot(&self) -> Result<Option<AwarenessUpdate>, EngineError> {
        let live = self.live_ids();
        if live.is_empty() {
            return Ok(None);
        }
        let snapshot = self
            .awareness
            .update_with_clients(live)
            .map_err(|error| EngineError::Presence(error.to_string()))?;
        Ok(Some(snapshot))
    }

    /// Remove the given presence entries, returning the removal delta to
    /// broadcast (or `None` when there was nothing to remove).
    pub fn clear(&self, ids: &[u64]) -> Result<Option<AwarenessUpdate>, EngineError> {
        if ids.is_empty() {
            return Ok(None);
        }
        for &id in ids {
            self.awareness.remove_state(id);
        }
        let delta = self
            .awareness
            .update_with_clients(ids.to_vec())
            .map_err(|error| EngineError::Presence(error.to_string()))?;
        Ok(Some(delta))
    }

    pub fn live_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .awareness
            .iter()
            .filter_map(|(client_id, state)| state.data.map(|_| client_id))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn live_count(&self) -> usize {
        self.live_ids().len()
    }
}
