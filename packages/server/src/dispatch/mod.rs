//! The campaign dispatch engine: deferred queue semantics, waitlist sync,
//! the promoter, the two-phase lease scope, the call worker, the cold-start
//! ramp, the retry sweep, and the reconcilers.

pub mod cold_start;
pub mod leases;
pub mod promoter;
pub mod queue;
pub mod reconcilers;
pub mod retry;
pub mod waitlist;
pub mod worker;

pub use cold_start::ColdStartControl;
pub use promoter::Promoter;
pub use queue::{lane_for, retry_backoff, DialQueue, DEFAULT_PARK_DELAY};
pub use reconcilers::{
    CounterReconciler, InvariantMonitor, LeaseJanitor, QueueReconciler, WaitlistCompactor,
};
pub use waitlist::WaitlistSyncer;
pub use worker::CallWorker;
