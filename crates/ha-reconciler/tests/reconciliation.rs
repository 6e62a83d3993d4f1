//! End-to-end behavior of the reconciler against a snapshot store
//!
//! All tests run on a paused clock; sleeping advances virtual time and fires
//! any timers that come due along the way.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ha_core::{ChannelError, EntityId, EntitySnapshot, FailureCause};
use ha_reconciler::{CommandPhase, Notice, Reconciler, TriggerOutcome};
use ha_state_store::SnapshotStore;
use tokio::time::sleep;

fn id(s: &str) -> EntityId {
    s.parse().unwrap()
}

struct Harness {
    store: Arc<SnapshotStore>,
    reconciler: Reconciler,
}

impl Harness {
    fn new(initial: &[(&str, &str)]) -> Self {
        let store = Arc::new(SnapshotStore::new());
        store.apply_batch(
            initial
                .iter()
                .map(|(entity_id, state)| EntitySnapshot::new(id(entity_id), *state))
                .collect(),
        );
        let reconciler = Reconciler::new(store.clone());
        Self { store, reconciler }
    }

    /// Push a snapshot the way the host does: store first, then reconcile
    fn push(&self, entity_id: &str, state: &str) {
        let batch = self
            .store
            .apply(EntitySnapshot::new(id(entity_id), state));
        self.reconciler.reconcile(&batch.snapshots);
    }
}

#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> impl FnOnce() + Send + 'static {
        let inner = self.0.clone();
        move || {
            inner.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn send_ok(&self) -> impl std::future::Future<Output = Result<(), ChannelError>> {
        let inner = self.0.clone();
        async move {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_trigger_while_in_flight_is_dropped() {
    let h = Harness::new(&[("light.kitchen", "off")]);
    let sends = Counter::default();

    let first = h
        .reconciler
        .trigger(id("light.kitchen"), "on", sends.send_ok(), || {})
        .await;
    let second = h
        .reconciler
        .trigger(id("light.kitchen"), "off", sends.send_ok(), || {})
        .await;

    assert_eq!(first, TriggerOutcome::Accepted);
    assert_eq!(second, TriggerOutcome::InFlight);
    assert_eq!(sends.get(), 1);
    assert_eq!(
        h.reconciler.pending(&id("light.kitchen")).unwrap().target_state,
        "on"
    );
    assert_eq!(
        h.reconciler.pending_target(&id("light.kitchen")).as_deref(),
        Some("on")
    );
    assert_eq!(h.reconciler.pending_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn double_tap_during_slow_send_is_dropped() {
    let h = Harness::new(&[("switch.heater", "off")]);
    let sends = Counter::default();

    let reconciler = h.reconciler.clone();
    let slow = sends.clone();
    let first = tokio::spawn(async move {
        reconciler
            .trigger(
                id("switch.heater"),
                "on",
                async move {
                    sleep(Duration::from_millis(100)).await;
                    slow.send_ok().await
                },
                || {},
            )
            .await
    });
    tokio::task::yield_now().await;
    assert!(h.reconciler.is_pending(&id("switch.heater")));

    let second = h
        .reconciler
        .trigger(id("switch.heater"), "on", sends.send_ok(), || {})
        .await;
    assert_eq!(second, TriggerOutcome::InFlight);

    assert_eq!(first.await.unwrap(), TriggerOutcome::Accepted);
    assert_eq!(sends.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn confirmation_cancels_timeout() {
    let h = Harness::new(&[("light.kitchen", "off")]);
    let rollbacks = Counter::default();

    h.reconciler
        .trigger(id("light.kitchen"), "on", async { Ok(()) }, rollbacks.bump())
        .await;

    sleep(Duration::from_millis(300)).await;
    h.push("light.kitchen", "on");
    assert_eq!(
        h.reconciler.phase(&id("light.kitchen")),
        Some(CommandPhase::CoolingDown)
    );

    // Still cooling down just before the window closes
    sleep(Duration::from_millis(49)).await;
    assert!(h.reconciler.is_cooling_down(&id("light.kitchen")));

    sleep(Duration::from_millis(2)).await;
    assert!(!h.reconciler.is_busy(&id("light.kitchen")));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(rollbacks.get(), 0);
    assert_eq!(h.reconciler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_rolls_back_exactly_once() {
    let h = Harness::new(&[("light.kitchen", "off")]);
    let rollbacks = Counter::default();
    let mut notices = h.reconciler.subscribe_notices();

    h.reconciler
        .trigger(id("light.kitchen"), "on", async { Ok(()) }, rollbacks.bump())
        .await;

    sleep(Duration::from_millis(1999)).await;
    assert_eq!(rollbacks.get(), 0);
    assert!(h.reconciler.is_pending(&id("light.kitchen")));

    sleep(Duration::from_millis(2)).await;
    assert_eq!(rollbacks.get(), 1);
    assert_eq!(h.reconciler.pending_count(), 0);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(rollbacks.get(), 1);

    assert_eq!(
        notices.recv().await.unwrap(),
        Notice::DeviceNotResponding {
            entity_id: id("light.kitchen")
        }
    );
}

#[tokio::test(start_paused = true)]
async fn non_matching_snapshots_do_not_fail_the_command() {
    let h = Harness::new(&[("cover.garage", "closed")]);
    let rollbacks = Counter::default();

    h.reconciler
        .trigger(id("cover.garage"), "opening", async { Ok(()) }, rollbacks.bump())
        .await;

    sleep(Duration::from_millis(500)).await;
    h.push("cover.garage", "closed");
    assert!(h.reconciler.is_pending(&id("cover.garage")));

    sleep(Duration::from_millis(500)).await;
    h.push("cover.garage", "opening");
    assert!(h.reconciler.is_cooling_down(&id("cover.garage")));

    sleep(Duration::from_secs(3)).await;
    assert_eq!(rollbacks.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn confirmation_just_before_deadline_wins() {
    let h = Harness::new(&[("light.kitchen", "off")]);
    let rollbacks = Counter::default();

    h.reconciler
        .trigger(id("light.kitchen"), "on", async { Ok(()) }, rollbacks.bump())
        .await;

    sleep(Duration::from_millis(1999)).await;
    h.push("light.kitchen", "on");

    sleep(Duration::from_millis(100)).await;
    assert_eq!(rollbacks.get(), 0);
    assert_eq!(h.reconciler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_sees_state_already_at_target() {
    let h = Harness::new(&[("light.kitchen", "off")]);
    let rollbacks = Counter::default();
    let mut notices = h.reconciler.subscribe_notices();

    h.reconciler
        .trigger(id("light.kitchen"), "on", async { Ok(()) }, rollbacks.bump())
        .await;

    // Written to the store without going through reconciliation
    sleep(Duration::from_millis(1999)).await;
    h.store
        .apply(EntitySnapshot::new(id("light.kitchen"), "on"));

    sleep(Duration::from_millis(2)).await;
    assert_eq!(rollbacks.get(), 0);
    assert!(notices.try_recv().is_err());

    // No cooldown on this path: the entity is free right away
    assert!(!h.reconciler.is_busy(&id("light.kitchen")));
    let next = h
        .reconciler
        .trigger(id("light.kitchen"), "off", async { Ok(()) }, || {})
        .await;
    assert_eq!(next, TriggerOutcome::Accepted);
}

#[tokio::test(start_paused = true)]
async fn send_failure_rolls_back_before_returning() {
    let h = Harness::new(&[("lock.front_door", "locked")]);
    let rollbacks = Counter::default();
    let mut notices = h.reconciler.subscribe_notices();

    let outcome = h
        .reconciler
        .trigger(
            id("lock.front_door"),
            "unlocked",
            async { Err(ChannelError::NotConnected) },
            rollbacks.bump(),
        )
        .await;

    assert_eq!(outcome, TriggerOutcome::SendFailed(FailureCause::Connection));
    assert_eq!(rollbacks.get(), 1);
    assert_eq!(h.reconciler.pending_count(), 0);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(rollbacks.get(), 1);

    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.message(), "Connection to Home Assistant lost");
    assert!(notices.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn send_failure_causes_are_classified() {
    let h = Harness::new(&[("switch.heater", "off")]);

    let auth = h
        .reconciler
        .trigger(
            id("switch.heater"),
            "on",
            async { Err(ChannelError::AuthInvalid("expired".into())) },
            || {},
        )
        .await;
    assert_eq!(auth, TriggerOutcome::SendFailed(FailureCause::Authentication));

    let rejected = h
        .reconciler
        .trigger(
            id("switch.heater"),
            "on",
            async {
                Err(ChannelError::Rejected {
                    code: "not_found".into(),
                    message: "Service not found".into(),
                })
            },
            || {},
        )
        .await;
    assert_eq!(
        rejected,
        TriggerOutcome::SendFailed(FailureCause::Communication)
    );
}

#[tokio::test(start_paused = true)]
async fn send_failure_after_confirmation_keeps_cooldown() {
    let h = Harness::new(&[("light.kitchen", "off")]);
    let rollbacks = Counter::default();
    let mut notices = h.reconciler.subscribe_notices();

    let reconciler = h.reconciler.clone();
    let rollback = rollbacks.bump();
    let first = tokio::spawn(async move {
        reconciler
            .trigger(
                id("light.kitchen"),
                "on",
                async {
                    sleep(Duration::from_millis(120)).await;
                    Err(ChannelError::ConnectionClosed)
                },
                rollback,
            )
            .await
    });

    sleep(Duration::from_millis(100)).await;
    h.push("light.kitchen", "on");
    assert!(h.reconciler.is_cooling_down(&id("light.kitchen")));

    assert_eq!(
        first.await.unwrap(),
        TriggerOutcome::SendFailed(FailureCause::Connection)
    );
    assert_eq!(rollbacks.get(), 0);
    assert!(notices.try_recv().is_err());

    // Confirmed at 100 ms, so the window runs until 150 ms
    assert!(h.reconciler.is_cooling_down(&id("light.kitchen")));
    let during = h
        .reconciler
        .trigger(id("light.kitchen"), "off", async { Ok(()) }, || {})
        .await;
    assert_eq!(during, TriggerOutcome::CoolingDown);

    sleep(Duration::from_millis(40)).await;
    let after = h
        .reconciler
        .trigger(id("light.kitchen"), "off", async { Ok(()) }, || {})
        .await;
    assert_eq!(after, TriggerOutcome::Accepted);
    assert_eq!(rollbacks.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn send_failure_after_timeout_rolls_back_once() {
    let h = Harness::new(&[("cover.garage", "closed")]);
    let rollbacks = Counter::default();
    let mut notices = h.reconciler.subscribe_notices();

    let reconciler = h.reconciler.clone();
    let rollback = rollbacks.bump();
    let first = tokio::spawn(async move {
        reconciler
            .trigger(
                id("cover.garage"),
                "opening",
                async {
                    sleep(Duration::from_millis(2500)).await;
                    Err(ChannelError::Rejected {
                        code: "home_assistant_error".into(),
                        message: "Device unreachable".into(),
                    })
                },
                rollback,
            )
            .await
    });

    sleep(Duration::from_millis(2001)).await;
    assert_eq!(rollbacks.get(), 1);
    assert_eq!(h.reconciler.pending_count(), 0);
    assert_eq!(
        notices.try_recv().unwrap(),
        Notice::DeviceNotResponding {
            entity_id: id("cover.garage")
        }
    );

    assert_eq!(
        first.await.unwrap(),
        TriggerOutcome::SendFailed(FailureCause::Communication)
    );
    assert_eq!(rollbacks.get(), 1);
    assert!(notices.try_recv().is_err());
    assert_eq!(h.reconciler.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn trigger_during_cooldown_is_dropped() {
    let h = Harness::new(&[("fan.bedroom", "off")]);
    let sends = Counter::default();

    h.reconciler
        .trigger(id("fan.bedroom"), "on", sends.send_ok(), || {})
        .await;
    h.push("fan.bedroom", "on");

    sleep(Duration::from_millis(20)).await;
    let during = h
        .reconciler
        .trigger(id("fan.bedroom"), "off", sends.send_ok(), || {})
        .await;

    assert_eq!(during, TriggerOutcome::CoolingDown);
    assert_eq!(sends.get(), 1);
    assert_eq!(h.reconciler.pending_target(&id("fan.bedroom")), None);
    assert_eq!(
        h.reconciler.pending(&id("fan.bedroom")).unwrap().target_state,
        "on"
    );
}

#[tokio::test(start_paused = true)]
async fn entities_are_independent() {
    let h = Harness::new(&[("light.kitchen", "off"), ("switch.heater", "off")]);
    let kitchen_rollbacks = Counter::default();
    let heater_rollbacks = Counter::default();

    h.reconciler
        .trigger(
            id("light.kitchen"),
            "on",
            async { Ok(()) },
            kitchen_rollbacks.bump(),
        )
        .await;
    let heater = h
        .reconciler
        .trigger(
            id("switch.heater"),
            "on",
            async { Ok(()) },
            heater_rollbacks.bump(),
        )
        .await;
    assert_eq!(heater, TriggerOutcome::Accepted);

    sleep(Duration::from_millis(200)).await;
    h.push("switch.heater", "on");
    assert!(h.reconciler.is_pending(&id("light.kitchen")));
    assert!(h.reconciler.is_cooling_down(&id("switch.heater")));

    sleep(Duration::from_millis(2000)).await;
    assert_eq!(kitchen_rollbacks.get(), 1);
    assert_eq!(heater_rollbacks.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn kitchen_light_scenario() {
    let h = Harness::new(&[("light.kitchen", "off")]);
    let rollbacks = Counter::default();

    let first = h
        .reconciler
        .trigger(id("light.kitchen"), "on", async { Ok(()) }, rollbacks.bump())
        .await;
    assert!(first.is_accepted());

    sleep(Duration::from_millis(300)).await;
    h.push("light.kitchen", "on");
    let cooldown_until = h
        .reconciler
        .pending(&id("light.kitchen"))
        .and_then(|p| p.cooldown_until)
        .unwrap();
    let started = h.reconciler.pending(&id("light.kitchen")).unwrap().started_at;
    let window = cooldown_until - started;
    assert!(window >= Duration::from_millis(350) && window < Duration::from_millis(352));

    sleep(Duration::from_millis(60)).await;
    let second = h
        .reconciler
        .trigger(id("light.kitchen"), "off", async { Ok(()) }, rollbacks.bump())
        .await;
    assert_eq!(second, TriggerOutcome::Accepted);

    // Nothing confirms "off": rolled back at the deadline
    sleep(Duration::from_millis(2001)).await;
    assert_eq!(rollbacks.get(), 1);
    assert_eq!(h.store.get_state(&id("light.kitchen")).as_deref(), Some("on"));
}
