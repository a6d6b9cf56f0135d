//! Coordinator substrate for cluster-wide admission control.
//!
//! The coordinator is the only shared mutable state in the system. Every
//! mutating access goes through a named atomic operation so that the slot
//! counters, the reservation ledger, and the waitlists can never be observed
//! in a torn state, even across process restarts. Two implementations ship:
//!
//! - [`redis::RedisCoordinator`] — production backend; each named operation
//!   is a server-side Lua script over hash-tagged per-campaign keys.
//! - [`memory::MemoryCoordinator`] — in-process backend with identical
//!   semantics, used by the deterministic test suite and local development.
//!
//! ```text
//! CampaignApi ──► queue_add ──► delayed ──► waitlist_push ──► wait:high/normal
//!                                                                │
//!            pop_reserve_promote (reserved++, ledger, gate++) ◄──┘
//!                     │
//!                     ▼
//!       queue_promote ──► waiting ──► queue_claim ──► acquire_pre_dial
//!                                                        │
//!                                 upgrade_to_active ◄────┘
//!                                        │
//!                                  release_slot ──► publish slot-available
//! ```

pub mod keys;
pub mod memory;
pub mod redis;
mod scripts;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::common::{CallLogId, CampaignId, ContactId, JobId};
use crate::config::ColdStartConfig;

pub use memory::MemoryCoordinator;
pub use redis::RedisCoordinator;

/// Initial pre-dial lease TTL.
pub const PRE_DIAL_LEASE_TTL: Duration = Duration::from_secs(20);

/// Cumulative cap on pre-dial renewals, measured from first acquisition.
pub const PRE_DIAL_TTL_CAP: Duration = Duration::from_secs(45);

/// Active lease TTL; released by webhook well before expiry in the normal
/// case.
pub const ACTIVE_LEASE_TTL: Duration = Duration::from_secs(200);

/// TTL on the warming cold-start marker. A campaign that never upgrades a
/// call stays pinned at the initial limit; only the janitor-deferral marker
/// expires.
pub const WARMING_TTL: Duration = Duration::from_secs(600);

// ============================================================================
// Value types
// ============================================================================

/// Which waitlist a job sits in. High is strictly preferred at pop time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    High,
    Normal,
}

impl Lane {
    /// One-letter origin tag recorded in the reservation ledger.
    pub fn ledger_prefix(&self) -> &'static str {
        match self {
            Lane::High => "H",
            Lane::Normal => "N",
        }
    }

    pub fn from_ledger_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "H" => Some(Lane::High),
            "N" => Some(Lane::Normal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::High => "high",
            Lane::Normal => "normal",
        }
    }
}

/// Opaque token proving lease ownership. Compared verbatim by the release
/// and renew operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Which phase of the two-phase lease a member belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePhase {
    PreDial,
    Active,
}

impl LeasePhase {
    /// Set member naming: `pre-<callId>` for pre-dial, bare id for active.
    pub fn member(&self, call_id: CallLogId) -> String {
        match self {
            LeasePhase::PreDial => format!("pre-{call_id}"),
            LeasePhase::Active => call_id.to_string(),
        }
    }
}

/// Outcome of a release. Mismatches are surfaced, not errored: retries and
/// webhooks may both attempt the same release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyReleased,
    TokenMismatch,
}

/// One popped waitlist entry inside a promote batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedEntry {
    pub lane: Lane,
    pub job_id: JobId,
}

/// Result of a `pop_reserve_promote` call.
#[derive(Debug, Clone, Default)]
pub struct PromoteBatch {
    /// Promotion sequence stamped on every job in this batch. Zero when the
    /// batch is empty (the gate is not bumped for no-op calls).
    pub seq: i64,
    pub entries: Vec<PromotedEntry>,
}

impl PromoteBatch {
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Lifecycle state of a queue-resident dial job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Delayed,
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
}

impl JobState {
    pub fn is_settled(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Queue-resident payload for one dial attempt.
///
/// Jobs are parked `delayed` with a long default deliver-at; only the
/// promoter moves them to `waiting`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub lane: Lane,
    pub state: JobState,
    /// Epoch ms the job becomes eligible for (reconciler-driven) promotion.
    pub deliver_at_ms: i64,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Promotion sequence stamped by the promoter. `-1` is the hard-sync
    /// sentinel written when a job is pushed back after repeated gate
    /// repairs.
    pub promote_seq: Option<i64>,
    /// Epoch ms of the promotion stamp.
    pub promoted_at_ms: Option<i64>,
    /// Times a worker refused this job for promotion-gate staleness.
    pub gate_repairs: u32,
}

impl QueueJob {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn park(
        campaign_id: CampaignId,
        contact_id: ContactId,
        lane: Lane,
        deliver_at_ms: i64,
    ) -> Self {
        Self {
            id: JobId::new(),
            campaign_id,
            contact_id,
            lane,
            state: JobState::Delayed,
            deliver_at_ms,
            attempts_made: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            promote_seq: None,
            promoted_at_ms: None,
            gate_repairs: 0,
        }
    }
}

/// Queue lifecycle event, fanned out to the waitlist syncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEventKind {
    Delayed,
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub campaign_id: CampaignId,
    pub job_id: JobId,
    pub contact_id: ContactId,
    pub lane: Lane,
    pub kind: QueueEventKind,
}

/// Outcome of a waitlist push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitlistPush {
    /// False when the marker already existed (duplicate event suppressed).
    pub pushed: bool,
    /// True when the contact id was already in the dedup set.
    pub duplicate_contact: bool,
}

/// Point-in-time view of one campaign's slot accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotSnapshot {
    pub limit: u32,
    /// Cardinality of the lease member set (pre-dial + active).
    pub inflight: u64,
    pub reserved: i64,
    pub ledger_len: u64,
}

impl SlotSnapshot {
    /// `(|leases| + reserved) / limit`; zero when no limit is set.
    pub fn saturation(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        (self.inflight as f64 + self.reserved.max(0) as f64) / self.limit as f64
    }

    pub fn capacity_exceeded(&self) -> bool {
        self.inflight as i64 + self.reserved > self.limit as i64 + 1
    }
}

/// Promoter circuit-breaker state, shared across instances through the
/// coordinator. Naming is deliberately distinct from the cold-start phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failures: u32,
    /// Start of the rolling failure-count window, epoch ms.
    pub window_start_ms: i64,
    /// When the breaker last opened, epoch ms.
    pub opened_at_ms: i64,
}

impl BreakerSnapshot {
    pub fn closed(now_ms: i64) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            window_start_ms: now_ms,
            opened_at_ms: 0,
        }
    }
}

/// Cold-start ramp phase for a freshly activated campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColdStartPhase {
    Warming,
    Ramping,
    Done,
}

impl ColdStartPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColdStartPhase::Warming => "warming",
            ColdStartPhase::Ramping => "ramping",
            ColdStartPhase::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warming" => Some(ColdStartPhase::Warming),
            "ramping" => Some(ColdStartPhase::Ramping),
            "done" => Some(ColdStartPhase::Done),
            _ => None,
        }
    }

    /// Whether the janitor should leave this campaign's members alone.
    pub fn defers_janitor(&self) -> bool {
        matches!(self, ColdStartPhase::Warming | ColdStartPhase::Ramping)
    }
}

// ============================================================================
// The substrate facade
// ============================================================================

/// Named atomic operations over the Redis-like substrate.
///
/// Read-modify-write sequences outside these operations are forbidden; the
/// per-campaign hash-tagged key space keeps every operation's inputs on one
/// shard so atomicity stays cheap in cluster mode.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Wall-clock epoch milliseconds as observed by this backend. All
    /// freshness math (ledger ages, promotion stamps, breaker windows) uses
    /// this clock so the in-memory backend stays testable under a paused
    /// runtime.
    fn now_ms(&self) -> i64;

    // --- slot ceiling + pause marker ---

    async fn set_limit(&self, campaign: CampaignId, limit: u32) -> Result<()>;
    async fn get_limit(&self, campaign: CampaignId) -> Result<Option<u32>>;
    async fn set_paused(&self, campaign: CampaignId, paused: bool) -> Result<()>;
    async fn is_paused(&self, campaign: CampaignId) -> Result<bool>;

    // --- promoter mutual exclusion ---

    async fn acquire_promoter_mutex(
        &self,
        campaign: CampaignId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool>;
    async fn renew_promoter_mutex(
        &self,
        campaign: CampaignId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool>;
    async fn release_promoter_mutex(&self, campaign: CampaignId, holder: &str) -> Result<()>;

    // --- admission ---

    /// Atomically: compute available slots under `limit`, pop up to `batch`
    /// job ids (high lane first), bump `reserved`, record each pop in the
    /// reservation ledger, and bump the promotion gate.
    async fn pop_reserve_promote(
        &self,
        campaign: CampaignId,
        limit: u32,
        batch: u32,
    ) -> Result<PromoteBatch>;

    /// Current promotion-gate sequence.
    async fn promote_gate(&self, campaign: CampaignId) -> Result<i64>;

    /// Give back one reserved slot: decrement `reserved` (clamped at zero)
    /// and drop the job's ledger entry. Returns false when no ledger entry
    /// existed (already claimed).
    async fn claim_reservation(&self, campaign: CampaignId, job_id: JobId) -> Result<bool>;

    // --- two-phase leases ---

    async fn acquire_pre_dial(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        fallback_limit: u32,
    ) -> Result<Option<LeaseToken>>;

    async fn renew_pre_dial(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        token: &LeaseToken,
    ) -> Result<bool>;

    async fn upgrade_to_active(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        pre_token: &LeaseToken,
    ) -> Result<Option<LeaseToken>>;

    async fn release_slot(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        token: &LeaseToken,
        phase: LeasePhase,
        publish: bool,
    ) -> Result<ReleaseOutcome>;

    // --- waitlists ---

    /// Idempotent push guarded by the per-job marker key. Also inserts the
    /// contact into the dedup set and reports collisions.
    async fn waitlist_push(
        &self,
        campaign: CampaignId,
        lane: Lane,
        job_id: JobId,
        contact_id: ContactId,
        marker_ttl: Duration,
        dedup_ttl: Duration,
    ) -> Result<WaitlistPush>;

    async fn waitlist_len(&self, campaign: CampaignId, lane: Lane) -> Result<u64>;
    async fn waitlist_sample(
        &self,
        campaign: CampaignId,
        lane: Lane,
        count: usize,
    ) -> Result<Vec<JobId>>;
    async fn waitlist_remove(&self, campaign: CampaignId, lane: Lane, job_id: JobId)
        -> Result<bool>;
    async fn has_marker(&self, campaign: CampaignId, job_id: JobId) -> Result<bool>;
    async fn delete_marker(&self, campaign: CampaignId, job_id: JobId) -> Result<()>;

    // --- deferred job queue ---

    /// Insert a parked job and emit a `delayed` event. Returns false when a
    /// job with this id already exists.
    async fn queue_add(&self, job: &QueueJob) -> Result<bool>;

    async fn queue_get(&self, campaign: CampaignId, job_id: JobId) -> Result<Option<QueueJob>>;

    /// Move a delayed job to waiting, stamping `promote_seq`/`promoted_at`.
    /// Emits a `waiting` event. Returns false when the job is missing or not
    /// delayed.
    async fn queue_promote(&self, campaign: CampaignId, job_id: JobId, seq: i64) -> Result<bool>;

    /// Pop the oldest waiting job and mark it active. Emits an `active`
    /// event.
    async fn queue_claim(&self, campaign: CampaignId) -> Result<Option<QueueJob>>;

    /// Re-park a job (retry backoff, pause re-delay, gate repair). Clears the
    /// promotion stamp, optionally bumps the attempt counter, and emits a
    /// `delayed` event.
    async fn queue_move_to_delayed(
        &self,
        campaign: CampaignId,
        job_id: JobId,
        deliver_at_ms: i64,
        bump_attempt: bool,
    ) -> Result<bool>;

    /// Rewrite mutable payload fields (gate repairs, sentinel stamps) without
    /// changing state.
    async fn queue_update(&self, job: &QueueJob) -> Result<()>;

    /// Move a job to a settled state and emit the matching event.
    async fn queue_finish(&self, campaign: CampaignId, job_id: JobId, state: JobState)
        -> Result<()>;

    /// Drop a job entirely (campaign cancel). Returns false when missing.
    async fn queue_remove(&self, campaign: CampaignId, job_id: JobId) -> Result<bool>;

    async fn queue_state(&self, campaign: CampaignId, job_id: JobId) -> Result<Option<JobState>>;

    /// First `count` delayed job ids, oldest deliver-at first.
    async fn queue_delayed_page(&self, campaign: CampaignId, count: usize) -> Result<Vec<JobId>>;

    /// Ids of all non-active jobs for the campaign (delayed, waiting,
    /// settled) — the cancel sweep's removal candidates.
    async fn queue_removable(&self, campaign: CampaignId) -> Result<Vec<JobId>>;

    // --- reconciler primitives ---

    async fn slot_snapshot(&self, campaign: CampaignId) -> Result<SlotSnapshot>;

    /// Remove lease members whose `lease:<member>` key has expired. Returns
    /// the number removed.
    async fn sweep_dead_members(&self, campaign: CampaignId) -> Result<u64>;

    /// Count members without a live lease key, without removing them.
    async fn orphan_member_count(&self, campaign: CampaignId) -> Result<u64>;

    /// Push ledger entries older than `older_than` back onto their origin
    /// waitlist, dropping the ledger entry and decrementing `reserved`
    /// (clamped). Returns the recovered entries.
    async fn recover_orphan_reservations(
        &self,
        campaign: CampaignId,
        older_than: Duration,
    ) -> Result<Vec<PromotedEntry>>;

    /// Force `reserved` to the ledger size (ledger is source of truth).
    /// Returns `(previous_reserved, ledger_len)`.
    async fn reconcile_reserved(&self, campaign: CampaignId) -> Result<(i64, u64)>;

    // --- promoter circuit breaker ---

    async fn breaker_get(&self, campaign: CampaignId) -> Result<Option<BreakerSnapshot>>;
    async fn breaker_set(&self, campaign: CampaignId, snapshot: &BreakerSnapshot) -> Result<()>;

    // --- cold start ---

    /// Enter the warming phase and pin the effective limit down to
    /// `initial_limit`.
    async fn cold_start_begin(&self, campaign: CampaignId, initial_limit: u32) -> Result<()>;

    async fn cold_start_phase(&self, campaign: CampaignId) -> Result<Option<ColdStartPhase>>;

    /// Record one successful upgrade; advances the ramp and raises the
    /// effective limit per the config. Returns the phase after the note.
    async fn cold_start_note_success(
        &self,
        campaign: CampaignId,
        cold: &ColdStartConfig,
        configured_limit: u32,
    ) -> Result<Option<ColdStartPhase>>;

    /// Rewind the ramp one step after a sustained carrier failure.
    async fn cold_start_rewind(
        &self,
        campaign: CampaignId,
        cold: &ColdStartConfig,
        configured_limit: u32,
    ) -> Result<()>;

    // --- events ---

    async fn publish_slot_available(&self, campaign: CampaignId) -> Result<()>;
    fn subscribe_slots(&self) -> broadcast::Receiver<CampaignId>;
    fn subscribe_queue_events(&self) -> broadcast::Receiver<QueueEvent>;

    // --- teardown ---

    /// Best-effort removal of every coordinator key for a cancelled
    /// campaign. Live lease keys are left to expire naturally.
    async fn clear_campaign(&self, campaign: CampaignId) -> Result<()>;
}
