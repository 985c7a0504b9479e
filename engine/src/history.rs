//! Bounded ring of recently sent snapshots.

use crate::snapshot::Snapshot;
use crate::{ConnectionId, SnapshotId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug)]
struct HistoryEntry {
    id: SnapshotId,
    views: HashMap<ConnectionId, Arc<Snapshot>>,
}

/// Snapshots retained per snapshot id and connection, oldest evicted first.
///
/// Each connection gets its own view because visibility filters differ per
/// connection.
#[derive(Debug)]
pub struct SnapshotHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl SnapshotHistory {
    /// Create a ring holding at most `capacity` snapshot ids (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the views sent under `id`, evicting the oldest entry when full.
    pub fn push(&mut self, id: SnapshotId, views: HashMap<ConnectionId, Arc<Snapshot>>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { id, views });
    }

    /// The view `connection` was sent under `id`, if still retained.
    pub fn get(&self, id: SnapshotId, connection: ConnectionId) -> Option<Arc<Snapshot>> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.views.get(&connection).cloned())
    }

    pub fn contains(&self, id: SnapshotId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Oldest retained snapshot id.
    pub fn oldest(&self) -> Option<SnapshotId> {
        self.entries.front().map(|e| e.id)
    }

    /// Drop every view held for `connection`.
    pub fn forget(&mut self, connection: ConnectionId) {
        for entry in &mut self.entries {
            entry.views.remove(&connection);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
