//! Application root: snapshot store, reconciler and command channel
//!
//! Controls receive a `&Home` (or a clone of its parts) instead of reaching
//! for a global store.

use std::sync::Arc;

use ha_core::events::StateChangedData;
use ha_core::{Action, CommandChannel, Domain, EntityId, EntitySnapshot, ServiceCall};
use ha_state_store::{SnapshotBatch, SnapshotStore};
use tracing::{debug, info, instrument};

use crate::{HomeError, OptimisticMirror, Reconciler, ReconcilerConfig, TriggerOutcome};

pub struct Home {
    store: Arc<SnapshotStore>,
    reconciler: Reconciler,
    channel: Arc<dyn CommandChannel>,
}

impl Home {
    pub fn new(channel: Arc<dyn CommandChannel>, config: ReconcilerConfig) -> Self {
        let store = Arc::new(SnapshotStore::new());
        let reconciler = Reconciler::with_config(store.clone(), config);
        Self {
            store,
            reconciler,
            channel,
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Write snapshots to the store, then reconcile pending commands
    pub fn apply_snapshots(&self, snapshots: Vec<EntitySnapshot>) -> SnapshotBatch {
        let batch = self.store.apply_batch(snapshots);
        self.reconciler.reconcile(&batch.snapshots);
        batch
    }

    /// Apply a pushed `state_changed` event
    pub fn apply_state_changed(&self, data: StateChangedData) -> SnapshotBatch {
        match data.new_state {
            Some(snapshot) => self.apply_snapshots(vec![snapshot]),
            None => {
                self.store.remove(&data.entity_id);
                SnapshotBatch {
                    snapshots: Vec::new(),
                    removed: vec![data.entity_id],
                }
            }
        }
    }

    /// Replace the store with the full entity list from the channel
    #[instrument(skip(self))]
    pub async fn load_states(&self) -> Result<usize, HomeError> {
        let states = self.channel.get_states().await?;
        let batch = self.store.replace_all(states);
        self.reconciler.reconcile(&batch.snapshots);
        info!(entities = batch.snapshots.len(), "Loaded entity states");
        Ok(batch.snapshots.len())
    }

    /// Resolve `action` for the entity's domain and issue it through the
    /// reconciler.
    #[instrument(skip(self, on_rollback), fields(entity_id = %entity_id))]
    pub async fn perform<R>(
        &self,
        entity_id: &EntityId,
        action: Action,
        on_rollback: R,
    ) -> Result<TriggerOutcome, HomeError>
    where
        R: FnOnce() + Send + 'static,
    {
        let domain =
            Domain::of(entity_id).ok_or_else(|| HomeError::UnsupportedDomain(entity_id.clone()))?;
        let current = self
            .store
            .get_state(entity_id)
            .ok_or_else(|| HomeError::UnknownEntity(entity_id.clone()))?;
        let command = domain
            .command(action, &current)
            .ok_or(HomeError::UnsupportedAction { domain, action })?;

        let call = ServiceCall::for_command(&command, entity_id);
        debug!(service = %call.service_id(), target = command.target_state, "Performing action");

        let channel = Arc::clone(&self.channel);
        let outcome = self
            .reconciler
            .trigger(
                entity_id.clone(),
                command.target_state,
                async move { channel.call_service(call).await },
                on_rollback,
            )
            .await;
        Ok(outcome)
    }

    /// A mirror seeded from the entity's current state
    pub fn mirror<T>(&self, entity_id: &EntityId, map: fn(&str) -> T) -> Option<OptimisticMirror<T>>
    where
        T: Clone + PartialEq + Send + 'static,
    {
        let state = self.store.get_state(entity_id)?;
        Some(OptimisticMirror::new(entity_id.clone(), &state, map))
    }

    pub fn clear_pending(&self, entity_id: &EntityId) -> bool {
        self.reconciler.clear_pending(entity_id)
    }

    /// Forget entities and pending commands (e.g., after disconnecting)
    pub fn reset(&self) {
        self.reconciler.clear_all();
        self.store.clear();
    }
}
