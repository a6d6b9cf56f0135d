//! Background sweepers that repair drift between the coordinator counters,
//! the reservation ledger, the waitlists, and the deferred queue.
//!
//! All sweeps are bounded, idempotent, and side-effect-minimal: they repair
//! state, log, and move on. None of them touches a live lease.

mod compactor;
mod counter_reconciler;
mod invariant_monitor;
mod janitor;
mod queue_reconciler;

pub use compactor::WaitlistCompactor;
pub use counter_reconciler::CounterReconciler;
pub use invariant_monitor::InvariantMonitor;
pub use janitor::LeaseJanitor;
pub use queue_reconciler::QueueReconciler;
