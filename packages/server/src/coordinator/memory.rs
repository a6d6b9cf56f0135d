//! In-memory coordinator with the same semantics as the Redis backend.
//!
//! Used by the deterministic test suite and local development. TTLs are
//! tracked against `tokio::time::Instant` and the backend clock is derived
//! from the same source, so tests running under a paused tokio runtime can
//! advance time and observe expiries exactly.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::common::{CallLogId, CampaignId, ContactId, JobId};
use crate::config::ColdStartConfig;

use super::{
    BreakerSnapshot, ColdStartPhase, Coordinator, JobState, Lane, LeasePhase, LeaseToken,
    PromoteBatch, PromotedEntry, QueueEvent, QueueEventKind, QueueJob, ReleaseOutcome,
    SlotSnapshot, WaitlistPush, ACTIVE_LEASE_TTL, PRE_DIAL_LEASE_TTL, PRE_DIAL_TTL_CAP,
    WARMING_TTL,
};

struct LeaseValue {
    token: String,
    acquired_at_ms: i64,
    expires_at: Instant,
}

#[derive(Default)]
struct CampaignState {
    limit: Option<u32>,
    paused: bool,
    /// Lease member set; a member may outlive its value (orphan) until the
    /// janitor sweeps it, mirroring the Redis layout.
    members: HashSet<String>,
    lease_values: HashMap<String, LeaseValue>,
    reserved: i64,
    /// `<origin>:<jobId>` -> reservation epoch ms.
    ledger: HashMap<String, i64>,
    wait_high: VecDeque<String>,
    wait_normal: VecDeque<String>,
    markers: HashMap<String, Instant>,
    seen: HashMap<String, Instant>,
    gate: i64,
    mutex: Option<(String, Instant)>,
    breaker: Option<BreakerSnapshot>,
    cold_phase: Option<ColdStartPhase>,
    cold_expires: Option<Instant>,
    cold_successes: u32,
    jobs: HashMap<JobId, QueueJob>,
    delayed: BTreeSet<(i64, String)>,
    waiting: VecDeque<JobId>,
    job_index: HashSet<JobId>,
}

impl CampaignState {
    fn prune(&mut self, now: Instant) {
        self.lease_values.retain(|_, v| v.expires_at > now);
        self.markers.retain(|_, expires| *expires > now);
        self.seen.retain(|_, expires| *expires > now);
        if self.mutex.as_ref().is_some_and(|(_, expires)| *expires <= now) {
            self.mutex = None;
        }
        if matches!(self.cold_phase, Some(ColdStartPhase::Warming)) {
            if let Some(expires) = self.cold_expires {
                if expires <= now {
                    self.cold_phase = None;
                    self.cold_expires = None;
                }
            }
        }
    }

    fn waitlist(&mut self, lane: Lane) -> &mut VecDeque<String> {
        match lane {
            Lane::High => &mut self.wait_high,
            Lane::Normal => &mut self.wait_normal,
        }
    }
}

pub struct MemoryCoordinator {
    state: Mutex<HashMap<CampaignId, CampaignState>>,
    base_wall_ms: i64,
    base_instant: Instant,
    slot_tx: broadcast::Sender<CampaignId>,
    queue_tx: broadcast::Sender<QueueEvent>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (slot_tx, _) = broadcast::channel(1024);
        let (queue_tx, _) = broadcast::channel(4096);
        Self {
            state: Mutex::new(HashMap::new()),
            base_wall_ms: Utc::now().timestamp_millis(),
            base_instant: Instant::now(),
            slot_tx,
            queue_tx,
        }
    }

    fn with<R>(&self, campaign: CampaignId, f: impl FnOnce(&mut CampaignState, Instant) -> R) -> R {
        let mut state = self.state.lock().expect("coordinator state poisoned");
        let now = Instant::now();
        let entry = state.entry(campaign).or_default();
        entry.prune(now);
        f(entry, now)
    }

    fn emit(&self, job: &QueueJob, kind: QueueEventKind) {
        let _ = self.queue_tx.send(QueueEvent {
            campaign_id: job.campaign_id,
            job_id: job.id,
            contact_id: job.contact_id,
            lane: job.lane,
            kind,
        });
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    fn now_ms(&self) -> i64 {
        self.base_wall_ms + self.base_instant.elapsed().as_millis() as i64
    }

    async fn set_limit(&self, campaign: CampaignId, limit: u32) -> Result<()> {
        self.with(campaign, |s, _| s.limit = Some(limit));
        Ok(())
    }

    async fn get_limit(&self, campaign: CampaignId) -> Result<Option<u32>> {
        Ok(self.with(campaign, |s, _| s.limit))
    }

    async fn set_paused(&self, campaign: CampaignId, paused: bool) -> Result<()> {
        self.with(campaign, |s, _| s.paused = paused);
        Ok(())
    }

    async fn is_paused(&self, campaign: CampaignId) -> Result<bool> {
        Ok(self.with(campaign, |s, _| s.paused))
    }

    async fn acquire_promoter_mutex(
        &self,
        campaign: CampaignId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        Ok(self.with(campaign, |s, now| {
            if s.mutex.is_some() {
                return false;
            }
            s.mutex = Some((holder.to_string(), now + ttl));
            true
        }))
    }

    async fn renew_promoter_mutex(
        &self,
        campaign: CampaignId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        Ok(self.with(campaign, |s, now| match &mut s.mutex {
            Some((current, expires)) if current == holder => {
                *expires = now + ttl;
                true
            }
            _ => false,
        }))
    }

    async fn release_promoter_mutex(&self, campaign: CampaignId, holder: &str) -> Result<()> {
        self.with(campaign, |s, _| {
            if matches!(&s.mutex, Some((current, _)) if current == holder) {
                s.mutex = None;
            }
        });
        Ok(())
    }

    async fn pop_reserve_promote(
        &self,
        campaign: CampaignId,
        limit: u32,
        batch: u32,
    ) -> Result<PromoteBatch> {
        let now_ms = self.now_ms();
        Ok(self.with(campaign, |s, _| {
            let inflight = s.members.len() as i64;
            let available = limit as i64 - inflight - s.reserved;
            if available <= 0 {
                return PromoteBatch::default();
            }
            let take = (batch as i64).min(available) as usize;

            let mut popped: Vec<(Lane, String)> = Vec::with_capacity(take);
            while popped.len() < take {
                if let Some(id) = s.wait_high.pop_front() {
                    popped.push((Lane::High, id));
                } else {
                    break;
                }
            }
            while popped.len() < take {
                if let Some(id) = s.wait_normal.pop_front() {
                    popped.push((Lane::Normal, id));
                } else {
                    break;
                }
            }
            if popped.is_empty() {
                return PromoteBatch::default();
            }

            s.reserved += popped.len() as i64;
            s.gate += 1;
            let seq = s.gate;

            let mut entries = Vec::with_capacity(popped.len());
            for (lane, id) in popped {
                s.ledger
                    .insert(format!("{}:{id}", lane.ledger_prefix()), now_ms);
                if let Ok(job_id) = id.parse() {
                    entries.push(PromotedEntry { lane, job_id });
                }
            }
            PromoteBatch { seq, entries }
        }))
    }

    async fn promote_gate(&self, campaign: CampaignId) -> Result<i64> {
        Ok(self.with(campaign, |s, _| s.gate))
    }

    async fn claim_reservation(&self, campaign: CampaignId, job_id: JobId) -> Result<bool> {
        Ok(self.with(campaign, |s, _| {
            let removed = s.ledger.remove(&format!("H:{job_id}")).is_some()
                || s.ledger.remove(&format!("N:{job_id}")).is_some();
            if removed {
                s.reserved = (s.reserved - 1).max(0);
            }
            removed
        }))
    }

    async fn acquire_pre_dial(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        fallback_limit: u32,
    ) -> Result<Option<LeaseToken>> {
        let now_ms = self.now_ms();
        Ok(self.with(campaign, |s, now| {
            let limit = s.limit.unwrap_or(fallback_limit) as i64;
            if s.members.len() as i64 + s.reserved >= limit + 1 {
                return None;
            }
            let member = LeasePhase::PreDial.member(call_id);
            let token = LeaseToken::generate();
            s.members.insert(member.clone());
            s.lease_values.insert(
                member,
                LeaseValue {
                    token: token.0.clone(),
                    acquired_at_ms: now_ms,
                    expires_at: now + PRE_DIAL_LEASE_TTL,
                },
            );
            Some(token)
        }))
    }

    async fn renew_pre_dial(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        token: &LeaseToken,
    ) -> Result<bool> {
        let now_ms = self.now_ms();
        Ok(self.with(campaign, |s, now| {
            let member = LeasePhase::PreDial.member(call_id);
            let Some(value) = s.lease_values.get_mut(&member) else {
                return false;
            };
            if value.token != token.0 {
                return false;
            }
            let remaining = PRE_DIAL_TTL_CAP.as_millis() as i64 - (now_ms - value.acquired_at_ms);
            if remaining <= 0 {
                return false;
            }
            let extend = (PRE_DIAL_LEASE_TTL.as_millis() as i64).min(remaining);
            value.expires_at = now + Duration::from_millis(extend as u64);
            true
        }))
    }

    async fn upgrade_to_active(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        pre_token: &LeaseToken,
    ) -> Result<Option<LeaseToken>> {
        let now_ms = self.now_ms();
        Ok(self.with(campaign, |s, now| {
            let pre_member = LeasePhase::PreDial.member(call_id);
            match s.lease_values.get(&pre_member) {
                Some(value) if value.token == pre_token.0 => {}
                _ => return None,
            }
            s.members.remove(&pre_member);
            s.lease_values.remove(&pre_member);

            let active_member = LeasePhase::Active.member(call_id);
            let token = LeaseToken::generate();
            s.members.insert(active_member.clone());
            s.lease_values.insert(
                active_member,
                LeaseValue {
                    token: token.0.clone(),
                    acquired_at_ms: now_ms,
                    expires_at: now + ACTIVE_LEASE_TTL,
                },
            );
            Some(token)
        }))
    }

    async fn release_slot(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        token: &LeaseToken,
        phase: LeasePhase,
        publish: bool,
    ) -> Result<ReleaseOutcome> {
        let outcome = self.with(campaign, |s, _| {
            let member = phase.member(call_id);
            let token_matches = s.lease_values.get(&member).map(|v| v.token == token.0);
            match token_matches {
                None => {
                    s.members.remove(&member);
                    ReleaseOutcome::AlreadyReleased
                }
                Some(false) => ReleaseOutcome::TokenMismatch,
                Some(true) => {
                    s.lease_values.remove(&member);
                    s.members.remove(&member);
                    ReleaseOutcome::Released
                }
            }
        });
        if publish && outcome == ReleaseOutcome::Released {
            let _ = self.slot_tx.send(campaign);
        }
        Ok(outcome)
    }

    async fn waitlist_push(
        &self,
        campaign: CampaignId,
        lane: Lane,
        job_id: JobId,
        contact_id: ContactId,
        marker_ttl: Duration,
        dedup_ttl: Duration,
    ) -> Result<WaitlistPush> {
        Ok(self.with(campaign, |s, now| {
            let duplicate_contact = s
                .seen
                .insert(contact_id.to_string(), now + dedup_ttl)
                .is_some();
            let marker = job_id.to_string();
            if s.markers.contains_key(&marker) {
                return WaitlistPush {
                    pushed: false,
                    duplicate_contact,
                };
            }
            s.markers.insert(marker.clone(), now + marker_ttl);
            s.waitlist(lane).push_back(marker);
            WaitlistPush {
                pushed: true,
                duplicate_contact,
            }
        }))
    }

    async fn waitlist_len(&self, campaign: CampaignId, lane: Lane) -> Result<u64> {
        Ok(self.with(campaign, |s, _| s.waitlist(lane).len() as u64))
    }

    async fn waitlist_sample(
        &self,
        campaign: CampaignId,
        lane: Lane,
        count: usize,
    ) -> Result<Vec<JobId>> {
        Ok(self.with(campaign, |s, _| {
            s.waitlist(lane)
                .iter()
                .take(count)
                .filter_map(|id| id.parse().ok())
                .collect()
        }))
    }

    async fn waitlist_remove(
        &self,
        campaign: CampaignId,
        lane: Lane,
        job_id: JobId,
    ) -> Result<bool> {
        Ok(self.with(campaign, |s, _| {
            let id = job_id.to_string();
            let list = s.waitlist(lane);
            let before = list.len();
            list.retain(|entry| *entry != id);
            list.len() < before
        }))
    }

    async fn has_marker(&self, campaign: CampaignId, job_id: JobId) -> Result<bool> {
        Ok(self.with(campaign, |s, _| s.markers.contains_key(&job_id.to_string())))
    }

    async fn delete_marker(&self, campaign: CampaignId, job_id: JobId) -> Result<()> {
        self.with(campaign, |s, _| s.markers.remove(&job_id.to_string()));
        Ok(())
    }

    async fn queue_add(&self, job: &QueueJob) -> Result<bool> {
        let added = self.with(job.campaign_id, |s, _| {
            if s.jobs.contains_key(&job.id) {
                return false;
            }
            s.jobs.insert(job.id, job.clone());
            s.delayed.insert((job.deliver_at_ms, job.id.to_string()));
            s.job_index.insert(job.id);
            true
        });
        if added {
            self.emit(job, QueueEventKind::Delayed);
        }
        Ok(added)
    }

    async fn queue_get(&self, campaign: CampaignId, job_id: JobId) -> Result<Option<QueueJob>> {
        Ok(self.with(campaign, |s, _| s.jobs.get(&job_id).cloned()))
    }

    async fn queue_promote(&self, campaign: CampaignId, job_id: JobId, seq: i64) -> Result<bool> {
        let now_ms = self.now_ms();
        let promoted = self.with(campaign, |s, _| {
            let Some(job) = s.jobs.get_mut(&job_id) else {
                return None;
            };
            if job.state != JobState::Delayed {
                return None;
            }
            let old_key = (job.deliver_at_ms, job_id.to_string());
            job.state = JobState::Waiting;
            job.promote_seq = Some(seq);
            job.promoted_at_ms = Some(now_ms);
            let snapshot = job.clone();
            s.delayed.remove(&old_key);
            s.waiting.push_back(job_id);
            Some(snapshot)
        });
        match promoted {
            Some(job) => {
                self.emit(&job, QueueEventKind::Waiting);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_claim(&self, campaign: CampaignId) -> Result<Option<QueueJob>> {
        let claimed = self.with(campaign, |s, _| loop {
            let Some(job_id) = s.waiting.pop_front() else {
                return None;
            };
            if let Some(job) = s.jobs.get_mut(&job_id) {
                job.state = JobState::Active;
                return Some(job.clone());
            }
        });
        if let Some(job) = &claimed {
            self.emit(job, QueueEventKind::Active);
        }
        Ok(claimed)
    }

    async fn queue_move_to_delayed(
        &self,
        campaign: CampaignId,
        job_id: JobId,
        deliver_at_ms: i64,
        bump_attempt: bool,
    ) -> Result<bool> {
        let moved = self.with(campaign, |s, _| {
            let Some(job) = s.jobs.get_mut(&job_id) else {
                return None;
            };
            if job.state == JobState::Delayed {
                return None;
            }
            job.state = JobState::Delayed;
            job.deliver_at_ms = deliver_at_ms;
            job.promote_seq = None;
            job.promoted_at_ms = None;
            if bump_attempt {
                job.attempts_made += 1;
            }
            let snapshot = job.clone();
            s.waiting.retain(|id| *id != job_id);
            s.delayed.insert((deliver_at_ms, job_id.to_string()));
            Some(snapshot)
        });
        match moved {
            Some(job) => {
                self.emit(&job, QueueEventKind::Delayed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_update(&self, job: &QueueJob) -> Result<()> {
        self.with(job.campaign_id, |s, _| {
            if s.jobs.contains_key(&job.id) {
                s.jobs.insert(job.id, job.clone());
            }
        });
        Ok(())
    }

    async fn queue_finish(
        &self,
        campaign: CampaignId,
        job_id: JobId,
        state: JobState,
    ) -> Result<()> {
        anyhow::ensure!(
            matches!(state, JobState::Completed | JobState::Failed | JobState::Stalled),
            "queue_finish requires a settled state"
        );
        let finished = self.with(campaign, |s, _| {
            let Some(job) = s.jobs.get_mut(&job_id) else {
                return None;
            };
            job.state = state;
            let snapshot = job.clone();
            s.delayed.remove(&(snapshot.deliver_at_ms, job_id.to_string()));
            s.waiting.retain(|id| *id != job_id);
            Some(snapshot)
        });
        if let Some(job) = finished {
            let kind = match state {
                JobState::Completed => QueueEventKind::Completed,
                JobState::Stalled => QueueEventKind::Stalled,
                _ => QueueEventKind::Failed,
            };
            self.emit(&job, kind);
        }
        Ok(())
    }

    async fn queue_remove(&self, campaign: CampaignId, job_id: JobId) -> Result<bool> {
        Ok(self.with(campaign, |s, _| {
            let existed = match s.jobs.remove(&job_id) {
                Some(job) => {
                    s.delayed.remove(&(job.deliver_at_ms, job_id.to_string()));
                    true
                }
                None => false,
            };
            s.waiting.retain(|id| *id != job_id);
            s.job_index.remove(&job_id);
            existed
        }))
    }

    async fn queue_state(&self, campaign: CampaignId, job_id: JobId) -> Result<Option<JobState>> {
        Ok(self.with(campaign, |s, _| s.jobs.get(&job_id).map(|j| j.state)))
    }

    async fn queue_delayed_page(
        &self,
        campaign: CampaignId,
        count: usize,
    ) -> Result<Vec<JobId>> {
        Ok(self.with(campaign, |s, _| {
            s.delayed
                .iter()
                .take(count)
                .filter_map(|(_, id)| id.parse().ok())
                .collect()
        }))
    }

    async fn queue_removable(&self, campaign: CampaignId) -> Result<Vec<JobId>> {
        Ok(self.with(campaign, |s, _| {
            s.job_index
                .iter()
                .filter(|id| {
                    s.jobs
                        .get(*id)
                        .map(|job| job.state != JobState::Active)
                        .unwrap_or(true)
                })
                .copied()
                .collect()
        }))
    }

    async fn slot_snapshot(&self, campaign: CampaignId) -> Result<SlotSnapshot> {
        Ok(self.with(campaign, |s, _| SlotSnapshot {
            limit: s.limit.unwrap_or(0),
            inflight: s.members.len() as u64,
            reserved: s.reserved,
            ledger_len: s.ledger.len() as u64,
        }))
    }

    async fn sweep_dead_members(&self, campaign: CampaignId) -> Result<u64> {
        Ok(self.with(campaign, |s, _| {
            let dead: Vec<String> = s
                .members
                .iter()
                .filter(|m| !s.lease_values.contains_key(*m))
                .cloned()
                .collect();
            for member in &dead {
                s.members.remove(member);
            }
            dead.len() as u64
        }))
    }

    async fn orphan_member_count(&self, campaign: CampaignId) -> Result<u64> {
        Ok(self.with(campaign, |s, _| {
            s.members
                .iter()
                .filter(|m| !s.lease_values.contains_key(*m))
                .count() as u64
        }))
    }

    async fn recover_orphan_reservations(
        &self,
        campaign: CampaignId,
        older_than: Duration,
    ) -> Result<Vec<PromotedEntry>> {
        let cutoff = self.now_ms() - older_than.as_millis() as i64;
        Ok(self.with(campaign, |s, _| {
            let stale: Vec<String> = s
                .ledger
                .iter()
                .filter(|(_, reserved_at)| **reserved_at <= cutoff)
                .map(|(member, _)| member.clone())
                .collect();
            let mut recovered = Vec::with_capacity(stale.len());
            for member in stale {
                s.ledger.remove(&member);
                s.reserved = (s.reserved - 1).max(0);
                let Some((prefix, id)) = member.split_once(':') else {
                    continue;
                };
                let Some(lane) = Lane::from_ledger_prefix(prefix) else {
                    continue;
                };
                s.waitlist(lane).push_back(id.to_string());
                if let Ok(job_id) = id.parse() {
                    recovered.push(PromotedEntry { lane, job_id });
                }
            }
            recovered
        }))
    }

    async fn reconcile_reserved(&self, campaign: CampaignId) -> Result<(i64, u64)> {
        Ok(self.with(campaign, |s, _| {
            let prev = s.reserved;
            let len = s.ledger.len() as u64;
            s.reserved = len as i64;
            (prev, len)
        }))
    }

    async fn breaker_get(&self, campaign: CampaignId) -> Result<Option<BreakerSnapshot>> {
        Ok(self.with(campaign, |s, _| s.breaker.clone()))
    }

    async fn breaker_set(&self, campaign: CampaignId, snapshot: &BreakerSnapshot) -> Result<()> {
        self.with(campaign, |s, _| s.breaker = Some(snapshot.clone()));
        Ok(())
    }

    async fn cold_start_begin(&self, campaign: CampaignId, initial_limit: u32) -> Result<()> {
        self.with(campaign, |s, now| {
            s.cold_phase = Some(ColdStartPhase::Warming);
            s.cold_expires = Some(now + WARMING_TTL);
            s.cold_successes = 0;
            s.limit = Some(initial_limit);
        });
        Ok(())
    }

    async fn cold_start_phase(&self, campaign: CampaignId) -> Result<Option<ColdStartPhase>> {
        Ok(self.with(campaign, |s, _| s.cold_phase))
    }

    async fn cold_start_note_success(
        &self,
        campaign: CampaignId,
        cold: &ColdStartConfig,
        configured_limit: u32,
    ) -> Result<Option<ColdStartPhase>> {
        Ok(self.with(campaign, |s, _| {
            let phase = s.cold_phase?;
            if phase == ColdStartPhase::Done {
                return Some(ColdStartPhase::Done);
            }
            s.cold_successes += 1;
            let limit = s.limit.unwrap_or(1);
            if s.cold_successes >= cold.done_after_successes {
                s.cold_phase = Some(ColdStartPhase::Done);
                s.cold_expires = None;
                s.limit = Some(configured_limit);
                return Some(ColdStartPhase::Done);
            }
            if s.cold_successes >= cold.ramp_after_successes {
                s.cold_phase = Some(ColdStartPhase::Ramping);
                s.cold_expires = None;
                let raised = configured_limit.min(limit.saturating_mul(cold.step_multiplier));
                if raised > limit {
                    s.limit = Some(raised);
                }
                return Some(ColdStartPhase::Ramping);
            }
            Some(phase)
        }))
    }

    async fn cold_start_rewind(
        &self,
        campaign: CampaignId,
        cold: &ColdStartConfig,
        configured_limit: u32,
    ) -> Result<()> {
        self.with(campaign, |s, now| {
            let Some(phase) = s.cold_phase else {
                return;
            };
            if phase == ColdStartPhase::Done {
                s.cold_phase = Some(ColdStartPhase::Ramping);
                s.cold_successes = cold.ramp_after_successes;
                s.limit = Some((configured_limit / 2).max(1));
            } else {
                s.cold_phase = Some(ColdStartPhase::Warming);
                s.cold_expires = Some(now + WARMING_TTL);
                s.cold_successes = 0;
                s.limit = Some(cold.initial_limit);
            }
        });
        Ok(())
    }

    async fn publish_slot_available(&self, campaign: CampaignId) -> Result<()> {
        let _ = self.slot_tx.send(campaign);
        Ok(())
    }

    fn subscribe_slots(&self) -> broadcast::Receiver<CampaignId> {
        self.slot_tx.subscribe()
    }

    fn subscribe_queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue_tx.subscribe()
    }

    async fn clear_campaign(&self, campaign: CampaignId) -> Result<()> {
        let mut state = self.state.lock().expect("coordinator state poisoned");
        state.remove(&campaign);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(campaign: CampaignId) -> QueueJob {
        QueueJob::park(campaign, ContactId::new(), Lane::Normal, 0)
    }

    #[tokio::test]
    async fn acquire_respects_the_ceiling_with_slack() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        coord.set_limit(campaign, 1).await.unwrap();

        let first = coord
            .acquire_pre_dial(campaign, CallLogId::new(), 1)
            .await
            .unwrap();
        assert!(first.is_some());

        // One slot of slack absorbs the upgrade race.
        let second = coord
            .acquire_pre_dial(campaign, CallLogId::new(), 1)
            .await
            .unwrap();
        assert!(second.is_some());

        let third = coord
            .acquire_pre_dial(campaign, CallLogId::new(), 1)
            .await
            .unwrap();
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        let call = CallLogId::new();
        coord.set_limit(campaign, 2).await.unwrap();

        let token = coord
            .acquire_pre_dial(campaign, call, 2)
            .await
            .unwrap()
            .unwrap();
        let first = coord
            .release_slot(campaign, call, &token, LeasePhase::PreDial, false)
            .await
            .unwrap();
        assert_eq!(first, ReleaseOutcome::Released);

        let second = coord
            .release_slot(campaign, call, &token, LeasePhase::PreDial, false)
            .await
            .unwrap();
        assert_eq!(second, ReleaseOutcome::AlreadyReleased);

        let snap = coord.slot_snapshot(campaign).await.unwrap();
        assert_eq!(snap.inflight, 0);
    }

    #[tokio::test]
    async fn mismatched_token_does_not_release() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        let call = CallLogId::new();
        coord.set_limit(campaign, 2).await.unwrap();

        coord.acquire_pre_dial(campaign, call, 2).await.unwrap();
        let outcome = coord
            .release_slot(
                campaign,
                call,
                &LeaseToken::generate(),
                LeasePhase::PreDial,
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::TokenMismatch);
        assert_eq!(coord.slot_snapshot(campaign).await.unwrap().inflight, 1);
    }

    #[tokio::test]
    async fn upgrade_keeps_cardinality_constant() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        let call = CallLogId::new();
        coord.set_limit(campaign, 1).await.unwrap();

        let pre = coord
            .acquire_pre_dial(campaign, call, 1)
            .await
            .unwrap()
            .unwrap();
        let before = coord.slot_snapshot(campaign).await.unwrap().inflight;
        let active = coord
            .upgrade_to_active(campaign, call, &pre)
            .await
            .unwrap()
            .unwrap();
        let after = coord.slot_snapshot(campaign).await.unwrap().inflight;
        assert_eq!(before, after);

        // The pre-dial token no longer releases anything.
        let outcome = coord
            .release_slot(campaign, call, &pre, LeasePhase::PreDial, false)
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::AlreadyReleased);

        let outcome = coord
            .release_slot(campaign, call, &active, LeasePhase::Active, false)
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_pre_dial_becomes_a_janitor_orphan() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        let call = CallLogId::new();
        coord.set_limit(campaign, 1).await.unwrap();

        coord.acquire_pre_dial(campaign, call, 1).await.unwrap();
        tokio::time::advance(PRE_DIAL_LEASE_TTL + Duration::from_secs(1)).await;

        assert_eq!(coord.orphan_member_count(campaign).await.unwrap(), 1);
        assert_eq!(coord.sweep_dead_members(campaign).await.unwrap(), 1);
        assert_eq!(coord.slot_snapshot(campaign).await.unwrap().inflight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn renewals_cannot_extend_past_the_cap() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        let call = CallLogId::new();
        coord.set_limit(campaign, 1).await.unwrap();

        let token = coord
            .acquire_pre_dial(campaign, call, 1)
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(coord.renew_pre_dial(campaign, call, &token).await.unwrap());
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(coord.renew_pre_dial(campaign, call, &token).await.unwrap());

        // 45s elapsed since acquisition: cap reached.
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(!coord.renew_pre_dial(campaign, call, &token).await.unwrap());
    }

    #[tokio::test]
    async fn pop_reserve_promote_prefers_high_lane_and_keeps_ledger() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        coord.set_limit(campaign, 3).await.unwrap();

        let high = job(campaign);
        let normal = job(campaign);
        for (lane, j) in [(Lane::High, &high), (Lane::Normal, &normal)] {
            coord.queue_add(j).await.unwrap();
            coord
                .waitlist_push(
                    campaign,
                    lane,
                    j.id,
                    j.contact_id,
                    Duration::from_secs(30),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }

        let batch = coord.pop_reserve_promote(campaign, 3, 10).await.unwrap();
        assert_eq!(batch.count(), 2);
        assert_eq!(batch.entries[0].lane, Lane::High);
        assert_eq!(batch.entries[0].job_id, high.id);

        let snap = coord.slot_snapshot(campaign).await.unwrap();
        assert_eq!(snap.reserved, 2);
        assert_eq!(snap.ledger_len, 2);

        assert!(coord.claim_reservation(campaign, high.id).await.unwrap());
        assert!(!coord.claim_reservation(campaign, high.id).await.unwrap());
        let snap = coord.slot_snapshot(campaign).await.unwrap();
        assert_eq!(snap.reserved, 1);
        assert_eq!(snap.ledger_len, 1);
    }

    #[tokio::test]
    async fn pop_is_bounded_by_available_slots() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        coord.set_limit(campaign, 2).await.unwrap();

        for _ in 0..5 {
            let j = job(campaign);
            coord.queue_add(&j).await.unwrap();
            coord
                .waitlist_push(
                    campaign,
                    Lane::Normal,
                    j.id,
                    j.contact_id,
                    Duration::from_secs(30),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }

        let batch = coord.pop_reserve_promote(campaign, 2, 10).await.unwrap();
        assert_eq!(batch.count(), 2);

        // Reserved slots now exhaust the limit.
        let batch = coord.pop_reserve_promote(campaign, 2, 10).await.unwrap();
        assert_eq!(batch.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_reservations_return_to_their_lane() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        coord.set_limit(campaign, 2).await.unwrap();

        let j = job(campaign);
        coord.queue_add(&j).await.unwrap();
        coord
            .waitlist_push(
                campaign,
                Lane::High,
                j.id,
                j.contact_id,
                Duration::from_secs(30),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        coord.pop_reserve_promote(campaign, 2, 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        let recovered = coord
            .recover_orphan_reservations(campaign, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].lane, Lane::High);

        let snap = coord.slot_snapshot(campaign).await.unwrap();
        assert_eq!(snap.reserved, 0);
        assert_eq!(snap.ledger_len, 0);
        assert_eq!(coord.waitlist_len(campaign, Lane::High).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn marker_suppresses_duplicate_pushes() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        let j = job(campaign);

        let first = coord
            .waitlist_push(
                campaign,
                Lane::Normal,
                j.id,
                j.contact_id,
                Duration::from_secs(30),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(first.pushed);

        let second = coord
            .waitlist_push(
                campaign,
                Lane::Normal,
                j.id,
                j.contact_id,
                Duration::from_secs(30),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(!second.pushed);
        assert!(second.duplicate_contact);
        assert_eq!(coord.waitlist_len(campaign, Lane::Normal).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_lifecycle_round_trip() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        let j = job(campaign);

        assert!(coord.queue_add(&j).await.unwrap());
        assert!(!coord.queue_add(&j).await.unwrap());
        assert_eq!(
            coord.queue_state(campaign, j.id).await.unwrap(),
            Some(JobState::Delayed)
        );

        assert!(coord.queue_promote(campaign, j.id, 7).await.unwrap());
        let claimed = coord.queue_claim(campaign).await.unwrap().unwrap();
        assert_eq!(claimed.id, j.id);
        assert_eq!(claimed.promote_seq, Some(7));
        assert_eq!(claimed.state, JobState::Active);

        // Re-delay clears the promotion stamp and bumps the attempt.
        assert!(coord
            .queue_move_to_delayed(campaign, j.id, 99, true)
            .await
            .unwrap());
        let parked = coord.queue_get(campaign, j.id).await.unwrap().unwrap();
        assert_eq!(parked.state, JobState::Delayed);
        assert_eq!(parked.attempts_made, 1);
        assert!(parked.promote_seq.is_none());
    }

    #[tokio::test]
    async fn counter_reconcile_follows_the_ledger() {
        let coord = MemoryCoordinator::new();
        let campaign = CampaignId::new();
        coord.set_limit(campaign, 5).await.unwrap();

        let j = job(campaign);
        coord.queue_add(&j).await.unwrap();
        coord
            .waitlist_push(
                campaign,
                Lane::Normal,
                j.id,
                j.contact_id,
                Duration::from_secs(30),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        coord.pop_reserve_promote(campaign, 5, 1).await.unwrap();

        // Simulate counter drift by claiming through a raw decrement path:
        // reconcile must restore reserved == |ledger|.
        let (prev, len) = coord.reconcile_reserved(campaign).await.unwrap();
        assert_eq!(prev, 1);
        assert_eq!(len, 1);
        assert_eq!(coord.slot_snapshot(campaign).await.unwrap().reserved, 1);
    }
}
