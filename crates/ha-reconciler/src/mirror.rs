//! Local optimistic copy of an entity's salient state
//!
//! Every control (switch, cover, fan, ...) uses the same mirror: it flips
//! its value as soon as the user acts, and only follows the authoritative
//! state again once the entity has no pending command and is out of its
//! cooldown. Blindly following every snapshot would flicker back to the
//! pre-action value while the remote system echoes stale states.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ha_core::{ChannelError, EntityId};
use ha_state_store::SnapshotBatch;
use tracing::trace;

use crate::{CommandPhase, Reconciler, TriggerOutcome};

/// Optimistic value of one control
///
/// `map` turns the authoritative state string into the control's value
/// (e.g. `|s| s == "on"` for a switch).
pub struct OptimisticMirror<T> {
    entity_id: EntityId,
    value: Arc<Mutex<T>>,
    map: fn(&str) -> T,
}

impl<T> OptimisticMirror<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Seed the mirror from the current authoritative state
    pub fn new(entity_id: EntityId, state: &str, map: fn(&str) -> T) -> Self {
        Self {
            entity_id,
            value: Arc::new(Mutex::new(map(state))),
            map,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// The value to render
    pub fn value(&self) -> T {
        lock(&self.value).clone()
    }

    /// Follow the authoritative state unless the entity is busy.
    ///
    /// Returns true when the rendered value changed.
    pub fn sync(&self, reconciler: &Reconciler, state: &str) -> bool {
        if reconciler.is_busy(&self.entity_id) {
            trace!(entity_id = %self.entity_id, "Keeping optimistic value");
            return false;
        }

        let next = (self.map)(state);
        let mut current = lock(&self.value);
        if *current == next {
            return false;
        }
        *current = next;
        true
    }

    /// [`sync`](Self::sync) with this mirror's entry from an applied batch
    pub fn sync_batch(&self, reconciler: &Reconciler, batch: &SnapshotBatch) -> bool {
        batch
            .snapshots
            .iter()
            .rev()
            .find(|s| s.entity_id == self.entity_id)
            .map(|s| self.sync(reconciler, &s.state))
            .unwrap_or(false)
    }

    /// Flip to `intended` now and issue the command.
    ///
    /// The previous value comes back if the command is dropped, cannot be
    /// sent, or is not confirmed in time.
    pub async fn request<F>(
        &self,
        reconciler: &Reconciler,
        intended: T,
        target_state: &str,
        send: F,
    ) -> TriggerOutcome
    where
        F: Future<Output = Result<(), ChannelError>>,
    {
        if let Some(phase) = reconciler.phase(&self.entity_id) {
            return match phase {
                CommandPhase::InFlight => TriggerOutcome::InFlight,
                CommandPhase::CoolingDown => TriggerOutcome::CoolingDown,
            };
        }

        let previous = std::mem::replace(&mut *lock(&self.value), intended);
        let restore = previous.clone();
        let value = Arc::clone(&self.value);

        let outcome = reconciler
            .trigger(self.entity_id.clone(), target_state, send, move || {
                *lock(&value) = previous;
            })
            .await;

        if matches!(
            outcome,
            TriggerOutcome::InFlight | TriggerOutcome::CoolingDown
        ) {
            // Lost the slot to a concurrent request; the rollback never ran
            *lock(&self.value) = restore;
        }
        outcome
    }
}

fn lock<T>(value: &Mutex<T>) -> MutexGuard<'_, T> {
    value.lock().unwrap_or_else(PoisonError::into_inner)
}
