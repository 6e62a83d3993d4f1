//! Per-entity pending command bookkeeping
//!
//! Each entity has at most one pending command. A command is either in
//! flight (waiting for a snapshot showing `target_state`) or confirmed and
//! cooling down. It leaves the map when the cooldown elapses, when the
//! confirmation deadline passes, or when the send itself fails.
//!
//! Timers are spawned tokio tasks. Every timer body re-checks that the map
//! entry it was started for is still the live one (by sequence number)
//! before touching it, so a cancelled or superseded timer is harmless even
//! if it wins a race with its abort.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ha_core::{ChannelError, EntityId, EntitySnapshot, FailureCause};
use ha_state_store::StateSource;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, instrument, trace, warn};

use crate::Notice;

/// Deadline from acceptance to mandatory resolution
pub const CONFIRM_TIMEOUT: Duration = Duration::from_millis(2000);

/// Grace period after a confirmed command
pub const COOLDOWN: Duration = Duration::from_millis(50);

const NOTICE_CHANNEL_CAPACITY: usize = 64;

type Rollback = Box<dyn FnOnce() + Send + 'static>;

/// Holds the caller's rollback until one terminal path takes it
struct RollbackSlot(Mutex<Option<Rollback>>);

impl RollbackSlot {
    fn new(rollback: Rollback) -> Self {
        Self(Mutex::new(Some(rollback)))
    }

    fn take(&mut self) -> Option<Rollback> {
        self.0.get_mut().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Timing parameters of the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub confirm_timeout: Duration,
    pub cooldown: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: CONFIRM_TIMEOUT,
            cooldown: COOLDOWN,
        }
    }
}

/// Phase of a live pending command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    InFlight,
    CoolingDown,
}

/// Result of a [`Reconciler::trigger`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Command sent, awaiting confirmation
    Accepted,
    /// Dropped: a command for this entity is already in flight
    InFlight,
    /// Dropped: the entity is in its post-confirmation cooldown
    CoolingDown,
    /// The send failed; the command was rolled back
    SendFailed(FailureCause),
}

impl TriggerOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TriggerOutcome::Accepted)
    }
}

/// Read-only view of a pending command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingView {
    pub target_state: String,
    pub started_at: Instant,
    pub cooldown_until: Option<Instant>,
}

struct PendingCommand {
    seq: u64,
    started_at: Instant,
    target_state: String,
    cooldown_until: Option<Instant>,
    /// Confirmation timeout while in flight, cleanup timer while cooling down
    timer: Option<AbortHandle>,
    rollback: RollbackSlot,
}

impl PendingCommand {
    fn phase(&self, now: Instant) -> Option<CommandPhase> {
        match self.cooldown_until {
            None => Some(CommandPhase::InFlight),
            Some(until) if now < until => Some(CommandPhase::CoolingDown),
            Some(_) => None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    pending: DashMap<EntityId, PendingCommand>,
    states: Arc<dyn StateSource>,
    config: ReconcilerConfig,
    next_seq: AtomicU64,
    notices: broadcast::Sender<Notice>,
}

impl Inner {
    fn notify(&self, notice: Notice) {
        warn!(entity_id = %notice.entity_id(), "{}", notice.message());
        // Ignore send errors - they just mean nobody is displaying notices
        let _ = self.notices.send(notice);
    }
}

/// Arbitrates one command at a time per entity
///
/// Cheap to clone; clones share the same pending map. Methods that start
/// timers must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(states: Arc<dyn StateSource>) -> Self {
        Self::with_config(states, ReconcilerConfig::default())
    }

    pub fn with_config(states: Arc<dyn StateSource>, config: ReconcilerConfig) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                states,
                config,
                next_seq: AtomicU64::new(1),
                notices,
            }),
        }
    }

    pub fn config(&self) -> ReconcilerConfig {
        self.inner.config
    }

    /// Subscribe to failure notices
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Issue a command for `entity_id` expecting it to reach `target_state`.
    ///
    /// Dropped without calling `send` when a command for the entity is in
    /// flight or cooling down. Otherwise the confirmation timeout is armed
    /// and `send` is awaited; if it fails, `on_rollback` runs and the entry
    /// is gone before this returns.
    #[instrument(skip(self, target_state, send, on_rollback), fields(entity_id = %entity_id))]
    pub async fn trigger<F, R>(
        &self,
        entity_id: EntityId,
        target_state: impl Into<String>,
        send: F,
        on_rollback: R,
    ) -> TriggerOutcome
    where
        F: Future<Output = Result<(), ChannelError>>,
        R: FnOnce() + Send + 'static,
    {
        let seq = match self.admit(&entity_id, target_state.into(), Box::new(on_rollback)) {
            Ok(seq) => seq,
            Err(rejected) => {
                debug!(outcome = ?rejected, "Command dropped");
                return rejected;
            }
        };

        match send.await {
            Ok(()) => {
                trace!(seq, "Command sent, awaiting confirmation");
                TriggerOutcome::Accepted
            }
            Err(err) => self.fail_send(&entity_id, seq, err),
        }
    }

    /// Guard checks and insertion, atomic per entity
    fn admit(
        &self,
        entity_id: &EntityId,
        target_state: String,
        rollback: Rollback,
    ) -> Result<u64, TriggerOutcome> {
        let now = Instant::now();

        let slot = match self.inner.pending.entry(entity_id.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().phase(now) {
                Some(CommandPhase::InFlight) => return Err(TriggerOutcome::InFlight),
                Some(CommandPhase::CoolingDown) => return Err(TriggerOutcome::CoolingDown),
                None => {
                    trace!("Replacing settled command awaiting cleanup");
                    occupied.get_mut().cancel_timer();
                    Entry::Occupied(occupied)
                }
            },
            vacant => vacant,
        };

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = now + self.inner.config.confirm_timeout;
        let timer = tokio::spawn(expire(
            Arc::clone(&self.inner),
            entity_id.clone(),
            seq,
            deadline,
        ))
        .abort_handle();

        debug!(seq, target_state = %target_state, "Command accepted");
        slot.insert(PendingCommand {
            seq,
            started_at: now,
            target_state,
            cooldown_until: None,
            timer: Some(timer),
            rollback: RollbackSlot::new(rollback),
        });

        Ok(seq)
    }

    fn fail_send(&self, entity_id: &EntityId, seq: u64, err: ChannelError) -> TriggerOutcome {
        let cause = err.cause();
        let removed = self
            .inner
            .pending
            .remove_if(entity_id, |_, c| c.seq == seq && c.cooldown_until.is_none());

        match removed {
            Some((_, mut command)) => {
                command.cancel_timer();
                if let Some(rollback) = command.rollback.take() {
                    rollback();
                }
                self.inner.notify(Notice::SendFailed {
                    entity_id: entity_id.clone(),
                    cause,
                    detail: err.to_string(),
                });
            }
            None => {
                // Already confirmed or timed out; nothing left to undo
                debug!(seq, error = %err, "Send failed after command settled");
            }
        }

        TriggerOutcome::SendFailed(cause)
    }

    /// Match freshly applied snapshots against in-flight commands.
    ///
    /// A snapshot whose state equals the command's target confirms it: the
    /// timeout is cancelled and the entry cools down before removal.
    /// Non-matching snapshots leave the command in flight.
    pub fn reconcile(&self, snapshots: &[EntitySnapshot]) {
        for snapshot in snapshots {
            let Some(mut command) = self.inner.pending.get_mut(&snapshot.entity_id) else {
                continue;
            };
            if command.cooldown_until.is_some() {
                continue;
            }
            if command.target_state != snapshot.state {
                trace!(
                    entity_id = %snapshot.entity_id,
                    state = %snapshot.state,
                    target = %command.target_state,
                    "Snapshot does not confirm pending command"
                );
                continue;
            }

            command.cancel_timer();
            let until = Instant::now() + self.inner.config.cooldown;
            command.cooldown_until = Some(until);
            let confirmed_rollback = command.rollback.take();
            command.timer = Some(
                tokio::spawn(release(
                    Arc::clone(&self.inner),
                    snapshot.entity_id.clone(),
                    command.seq,
                    until,
                ))
                .abort_handle(),
            );

            debug!(
                entity_id = %snapshot.entity_id,
                elapsed_ms = command.started_at.elapsed().as_millis() as u64,
                "Command confirmed"
            );
            drop(command);
            drop(confirmed_rollback);
        }
    }

    /// Current phase of the entity's command, `None` when it is free
    pub fn phase(&self, entity_id: &EntityId) -> Option<CommandPhase> {
        self.inner
            .pending
            .get(entity_id)
            .and_then(|c| c.phase(Instant::now()))
    }

    pub fn is_pending(&self, entity_id: &EntityId) -> bool {
        self.phase(entity_id) == Some(CommandPhase::InFlight)
    }

    pub fn is_cooling_down(&self, entity_id: &EntityId) -> bool {
        self.phase(entity_id) == Some(CommandPhase::CoolingDown)
    }

    /// Pending or cooling down: the entity accepts no new command and
    /// mirrors must not resynchronize
    pub fn is_busy(&self, entity_id: &EntityId) -> bool {
        self.phase(entity_id).is_some()
    }

    pub fn pending(&self, entity_id: &EntityId) -> Option<PendingView> {
        self.inner.pending.get(entity_id).map(|c| PendingView {
            target_state: c.target_state.clone(),
            started_at: c.started_at,
            cooldown_until: c.cooldown_until,
        })
    }

    /// Target state of the in-flight command, if any
    pub fn pending_target(&self, entity_id: &EntityId) -> Option<String> {
        self.inner
            .pending
            .get(entity_id)
            .filter(|c| c.phase(Instant::now()) == Some(CommandPhase::InFlight))
            .map(|c| c.target_state.clone())
    }

    /// Number of entries in the pending map, settled ones included
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Drop the entity's command without rolling back
    pub fn clear_pending(&self, entity_id: &EntityId) -> bool {
        match self.inner.pending.remove(entity_id) {
            Some((_, mut command)) => {
                command.cancel_timer();
                debug!(entity_id = %entity_id, "Pending command cleared");
                true
            }
            None => false,
        }
    }

    /// Drop every pending command without rolling back
    pub fn clear_all(&self) {
        let ids: Vec<EntityId> = self.inner.pending.iter().map(|r| r.key().clone()).collect();
        for entity_id in ids {
            self.clear_pending(&entity_id);
        }
    }
}

/// Confirmation deadline for command `seq`
async fn expire(inner: Arc<Inner>, entity_id: EntityId, seq: u64, deadline: Instant) {
    sleep_until(deadline).await;

    let Some((_, mut command)) = inner
        .pending
        .remove_if(&entity_id, |_, c| c.seq == seq && c.cooldown_until.is_none())
    else {
        trace!(entity_id = %entity_id, seq, "Stale confirmation timeout");
        return;
    };

    let current = inner.states.current_state(&entity_id);
    if current.as_deref() == Some(command.target_state.as_str()) {
        // Confirmed just under the wire; settles without a cooldown
        debug!(entity_id = %entity_id, "Late confirmation at timeout");
        return;
    }

    if let Some(rollback) = command.rollback.take() {
        rollback();
    }
    debug!(
        entity_id = %entity_id,
        target = %command.target_state,
        current = current.as_deref().unwrap_or("<none>"),
        "Command timed out"
    );
    inner.notify(Notice::DeviceNotResponding { entity_id });
}

/// End of the cooldown for command `seq`
async fn release(inner: Arc<Inner>, entity_id: EntityId, seq: u64, until: Instant) {
    sleep_until(until).await;
    if inner.pending.remove_if(&entity_id, |_, c| c.seq == seq).is_some() {
        trace!(entity_id = %entity_id, seq, "Cooldown elapsed");
    }
}
