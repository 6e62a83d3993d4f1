//! Optimistic entity command reconciliation
//!
//! A control flips its rendered value the instant the user acts, the command
//! goes out over the channel, and the [`Reconciler`] then waits for an
//! authoritative snapshot showing the expected state. If none shows up before
//! the confirmation deadline the control is rolled back.
//!
//! - [`Reconciler`] owns the per-entity pending commands and their timers.
//! - [`OptimisticMirror`] is the per-control local value that follows the
//!   authoritative state except while a command is pending or cooling down.
//! - [`Home`] is the application root wiring the snapshot store, the
//!   reconciler and the command channel together.

mod error;
mod home;
mod mirror;
mod notice;
mod reconciler;

pub use error::HomeError;
pub use home::Home;
pub use mirror::OptimisticMirror;
pub use notice::Notice;
pub use reconciler::{
    CommandPhase, PendingView, Reconciler, ReconcilerConfig, TriggerOutcome, COOLDOWN,
    CONFIRM_TIMEOUT,
};
