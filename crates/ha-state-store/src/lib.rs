//! Authoritative entity snapshot store
//!
//! This crate provides the SnapshotStore, which holds the latest snapshot
//! reported by Home Assistant for every entity. Snapshots are replaced
//! wholesale ("latest wins"); every applied batch is broadcast so optimistic
//! mirrors and the host can react to it.

use std::collections::HashSet;

use dashmap::DashMap;
use ha_core::{EntityId, EntitySnapshot};
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace};

/// Default channel capacity for batch subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Read access to the latest known state of an entity
pub trait StateSource: Send + Sync {
    fn current_state(&self, entity_id: &EntityId) -> Option<String>;
}

/// A set of snapshots applied together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotBatch {
    /// Snapshots written by this batch
    pub snapshots: Vec<EntitySnapshot>,
    /// Entities dropped by this batch
    pub removed: Vec<EntityId>,
}

impl SnapshotBatch {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.removed.is_empty()
    }

    /// Whether the batch touches the given entity
    pub fn touches(&self, entity_id: &EntityId) -> bool {
        self.snapshots.iter().any(|s| &s.entity_id == entity_id)
            || self.removed.contains(entity_id)
    }
}

/// The snapshot store tracks the authoritative state of all entities
pub struct SnapshotStore {
    snapshots: DashMap<EntityId, EntitySnapshot>,
    updates: broadcast::Sender<SnapshotBatch>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a store whose update channel buffers `capacity` batches
    pub fn with_capacity(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        Self {
            snapshots: DashMap::new(),
            updates,
        }
    }

    /// Subscribe to applied batches
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotBatch> {
        self.updates.subscribe()
    }

    /// Apply a single snapshot
    pub fn apply(&self, snapshot: EntitySnapshot) -> SnapshotBatch {
        self.apply_batch(vec![snapshot])
    }

    /// Apply a batch of snapshots; each one replaces the previous snapshot
    /// of its entity. Returns the batch as broadcast.
    #[instrument(skip_all, fields(count = snapshots.len()))]
    pub fn apply_batch(&self, snapshots: Vec<EntitySnapshot>) -> SnapshotBatch {
        for snapshot in &snapshots {
            trace!(entity_id = %snapshot.entity_id, state = %snapshot.state, "Applying snapshot");
            self.snapshots
                .insert(snapshot.entity_id.clone(), snapshot.clone());
        }

        let batch = SnapshotBatch {
            snapshots,
            removed: Vec::new(),
        };
        self.publish(&batch);
        batch
    }

    /// Replace the whole store with a bulk entity list.
    ///
    /// Entities missing from `snapshots` are dropped and reported as removed.
    #[instrument(skip_all, fields(count = snapshots.len()))]
    pub fn replace_all(&self, snapshots: Vec<EntitySnapshot>) -> SnapshotBatch {
        let incoming: HashSet<&EntityId> = snapshots.iter().map(|s| &s.entity_id).collect();
        let removed: Vec<EntityId> = self
            .snapshots
            .iter()
            .filter(|r| !incoming.contains(r.key()))
            .map(|r| r.key().clone())
            .collect();

        for entity_id in &removed {
            self.snapshots.remove(entity_id);
        }
        for snapshot in &snapshots {
            self.snapshots
                .insert(snapshot.entity_id.clone(), snapshot.clone());
        }

        debug!(removed = removed.len(), "Replaced entity list");

        let batch = SnapshotBatch { snapshots, removed };
        self.publish(&batch);
        batch
    }

    /// Drop an entity's snapshot
    pub fn remove(&self, entity_id: &EntityId) -> Option<EntitySnapshot> {
        let old = self.snapshots.remove(entity_id).map(|(_, s)| s);
        if old.is_some() {
            trace!(entity_id = %entity_id, "Removing entity snapshot");
            self.publish(&SnapshotBatch {
                snapshots: Vec::new(),
                removed: vec![entity_id.clone()],
            });
        }
        old
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<EntitySnapshot> {
        self.snapshots.get(entity_id).map(|s| s.clone())
    }

    /// Get the state value, or None if the entity is unknown
    pub fn get_state(&self, entity_id: &EntityId) -> Option<String> {
        self.snapshots.get(entity_id).map(|s| s.state.clone())
    }

    /// All snapshots, sorted by entity id
    pub fn all(&self) -> Vec<EntitySnapshot> {
        let mut all: Vec<EntitySnapshot> =
            self.snapshots.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    pub fn entity_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Forget everything (e.g., on disconnect)
    pub fn clear(&self) {
        let removed: Vec<EntityId> = self.snapshots.iter().map(|r| r.key().clone()).collect();
        self.snapshots.clear();
        if !removed.is_empty() {
            self.publish(&SnapshotBatch {
                snapshots: Vec::new(),
                removed,
            });
        }
    }

    fn publish(&self, batch: &SnapshotBatch) {
        if batch.is_empty() {
            return;
        }
        // Ignore send errors - they just mean no active receivers
        let _ = self.updates.send(batch.clone());
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSource for SnapshotStore {
    fn current_state(&self, entity_id: &EntityId) -> Option<String> {
        self.get_state(entity_id)
    }
}
