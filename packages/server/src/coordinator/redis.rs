//! Redis-backed coordinator.
//!
//! Multi-key operations run as Lua scripts (see [`super::scripts`]); single
//! commands that are already atomic (SET NX EX, GET, DEL) go straight through
//! the connection manager. A background task pumps the two pub/sub channels
//! into in-process broadcast channels, reconnecting on error.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::common::{CallLogId, CampaignId, JobId};
use crate::config::ColdStartConfig;

use super::keys::{CampaignKeys, QUEUE_EVENTS_CHANNEL, SLOT_EVENTS_CHANNEL};
use super::{
    scripts, BreakerSnapshot, ColdStartPhase, Coordinator, JobState, Lane, LeasePhase, LeaseToken,
    PromoteBatch, PromotedEntry, QueueEvent, QueueJob, ReleaseOutcome, SlotSnapshot, WaitlistPush,
    ACTIVE_LEASE_TTL, PRE_DIAL_LEASE_TTL, PRE_DIAL_TTL_CAP, WARMING_TTL,
};

struct ScriptSet {
    pop_reserve_promote: Script,
    acquire_pre_dial: Script,
    renew_pre_dial: Script,
    upgrade_to_active: Script,
    release_slot: Script,
    claim_reservation: Script,
    waitlist_push: Script,
    queue_add: Script,
    queue_promote: Script,
    queue_claim: Script,
    queue_move_to_delayed: Script,
    queue_finish: Script,
    queue_remove: Script,
    sweep_dead_members: Script,
    orphan_member_count: Script,
    recover_orphans: Script,
    reconcile_reserved: Script,
    slot_snapshot: Script,
    mutex_renew: Script,
    mutex_release: Script,
    cold_start_note_success: Script,
    cold_start_rewind: Script,
    clear_campaign: Script,
}

impl ScriptSet {
    fn new() -> Self {
        Self {
            pop_reserve_promote: Script::new(scripts::POP_RESERVE_PROMOTE),
            acquire_pre_dial: Script::new(scripts::ACQUIRE_PRE_DIAL),
            renew_pre_dial: Script::new(scripts::RENEW_PRE_DIAL),
            upgrade_to_active: Script::new(scripts::UPGRADE_TO_ACTIVE),
            release_slot: Script::new(scripts::RELEASE_SLOT),
            claim_reservation: Script::new(scripts::CLAIM_RESERVATION),
            waitlist_push: Script::new(scripts::WAITLIST_PUSH),
            queue_add: Script::new(scripts::QUEUE_ADD),
            queue_promote: Script::new(scripts::QUEUE_PROMOTE),
            queue_claim: Script::new(scripts::QUEUE_CLAIM),
            queue_move_to_delayed: Script::new(scripts::QUEUE_MOVE_TO_DELAYED),
            queue_finish: Script::new(scripts::QUEUE_FINISH),
            queue_remove: Script::new(scripts::QUEUE_REMOVE),
            sweep_dead_members: Script::new(scripts::SWEEP_DEAD_MEMBERS),
            orphan_member_count: Script::new(scripts::ORPHAN_MEMBER_COUNT),
            recover_orphans: Script::new(scripts::RECOVER_ORPHAN_RESERVATIONS),
            reconcile_reserved: Script::new(scripts::RECONCILE_RESERVED),
            slot_snapshot: Script::new(scripts::SLOT_SNAPSHOT),
            mutex_renew: Script::new(scripts::MUTEX_RENEW),
            mutex_release: Script::new(scripts::MUTEX_RELEASE),
            cold_start_note_success: Script::new(scripts::COLD_START_NOTE_SUCCESS),
            cold_start_rewind: Script::new(scripts::COLD_START_REWIND),
            clear_campaign: Script::new(scripts::CLEAR_CAMPAIGN),
        }
    }
}

pub struct RedisCoordinator {
    conn: ConnectionManager,
    scripts: ScriptSet,
    slot_tx: broadcast::Sender<CampaignId>,
    queue_tx: broadcast::Sender<QueueEvent>,
}

impl RedisCoordinator {
    /// Connect and start the pub/sub pump.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to redis")?;

        let (slot_tx, _) = broadcast::channel(1024);
        let (queue_tx, _) = broadcast::channel(4096);

        tokio::spawn(pump_events(client, slot_tx.clone(), queue_tx.clone()));

        Ok(Self {
            conn,
            scripts: ScriptSet::new(),
            slot_tx,
            queue_tx,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Forward pub/sub messages into the in-process broadcast channels,
/// reconnecting with a delay on any failure.
async fn pump_events(
    client: redis::Client,
    slot_tx: broadcast::Sender<CampaignId>,
    queue_tx: broadcast::Sender<QueueEvent>,
) {
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                warn!(error = %e, "pubsub connect failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if let Err(e) = pubsub
            .subscribe(&[SLOT_EVENTS_CHANNEL, QUEUE_EVENTS_CHANNEL])
            .await
        {
            warn!(error = %e, "pubsub subscribe failed, retrying");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "undecodable pubsub payload");
                    continue;
                }
            };

            match channel.as_str() {
                SLOT_EVENTS_CHANNEL => {
                    if let Ok(campaign) = payload.parse() {
                        let _ = slot_tx.send(campaign);
                    }
                }
                QUEUE_EVENTS_CHANNEL => match serde_json::from_str::<QueueEvent>(&payload) {
                    Ok(event) => {
                        let _ = queue_tx.send(event);
                    }
                    Err(e) => debug!(error = %e, "undecodable queue event"),
                },
                _ => {}
            }
        }

        warn!("pubsub stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn queue_event(job: &QueueJob, kind: super::QueueEventKind) -> QueueEvent {
    QueueEvent {
        campaign_id: job.campaign_id,
        job_id: job.id,
        contact_id: job.contact_id,
        lane: job.lane,
        kind,
    }
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn set_limit(&self, campaign: CampaignId, limit: u32) -> Result<()> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        conn.set::<_, _, ()>(keys.limit(), limit).await?;
        Ok(())
    }

    async fn get_limit(&self, campaign: CampaignId) -> Result<Option<u32>> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        Ok(conn.get(keys.limit()).await?)
    }

    async fn set_paused(&self, campaign: CampaignId, paused: bool) -> Result<()> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        if paused {
            conn.set::<_, _, ()>(keys.paused(), 1).await?;
        } else {
            conn.del::<_, ()>(keys.paused()).await?;
        }
        Ok(())
    }

    async fn is_paused(&self, campaign: CampaignId) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        Ok(conn.exists(keys.paused()).await?)
    }

    async fn acquire_promoter_mutex(
        &self,
        campaign: CampaignId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(keys.mutex())
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn renew_promoter_mutex(
        &self,
        campaign: CampaignId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let renewed: i64 = self
            .scripts
            .mutex_renew
            .key(keys.mutex())
            .arg(holder)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(renewed == 1)
    }

    async fn release_promoter_mutex(&self, campaign: CampaignId, holder: &str) -> Result<()> {
        let keys = CampaignKeys::new(campaign);
        let _: i64 = self
            .scripts
            .mutex_release
            .key(keys.mutex())
            .arg(holder)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn pop_reserve_promote(
        &self,
        campaign: CampaignId,
        limit: u32,
        batch: u32,
    ) -> Result<PromoteBatch> {
        let keys = CampaignKeys::new(campaign);
        let raw: Vec<String> = self
            .scripts
            .pop_reserve_promote
            .key(keys.leases())
            .key(keys.reserved())
            .key(keys.waitlist(Lane::High))
            .key(keys.waitlist(Lane::Normal))
            .key(keys.gate())
            .key(keys.ledger())
            .arg(limit)
            .arg(batch)
            .arg(self.now_ms())
            .invoke_async(&mut self.conn())
            .await?;

        let count: usize = raw
            .first()
            .map(|s| s.parse().unwrap_or(0))
            .unwrap_or(0);
        if count == 0 {
            return Ok(PromoteBatch::default());
        }
        let seq: i64 = raw.get(1).map(|s| s.parse().unwrap_or(0)).unwrap_or(0);
        let mut entries = Vec::with_capacity(count);
        for member in raw.iter().skip(2) {
            if let Some(entry) = parse_ledger_member(member) {
                entries.push(entry);
            }
        }
        Ok(PromoteBatch { seq, entries })
    }

    async fn promote_gate(&self, campaign: CampaignId) -> Result<i64> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let gate: Option<i64> = conn.get(keys.gate()).await?;
        Ok(gate.unwrap_or(0))
    }

    async fn claim_reservation(&self, campaign: CampaignId, job_id: JobId) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let claimed: i64 = self
            .scripts
            .claim_reservation
            .key(keys.ledger())
            .key(keys.reserved())
            .arg(format!("H:{job_id}"))
            .arg(format!("N:{job_id}"))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(claimed == 1)
    }

    async fn acquire_pre_dial(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        fallback_limit: u32,
    ) -> Result<Option<LeaseToken>> {
        let keys = CampaignKeys::new(campaign);
        let member = LeasePhase::PreDial.member(call_id);
        let token = LeaseToken::generate();
        let acquired: Option<i64> = self
            .scripts
            .acquire_pre_dial
            .key(keys.leases())
            .key(keys.reserved())
            .key(keys.limit())
            .key(keys.lease(&member))
            .arg(&member)
            .arg(token.as_str())
            .arg(fallback_limit)
            .arg(PRE_DIAL_LEASE_TTL.as_secs())
            .arg(self.now_ms())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(acquired.map(|_| token))
    }

    async fn renew_pre_dial(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        token: &LeaseToken,
    ) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let member = LeasePhase::PreDial.member(call_id);
        let renewed: i64 = self
            .scripts
            .renew_pre_dial
            .key(keys.lease(&member))
            .arg(token.as_str())
            .arg(PRE_DIAL_LEASE_TTL.as_secs())
            .arg(PRE_DIAL_TTL_CAP.as_millis() as i64)
            .arg(self.now_ms())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(renewed == 1)
    }

    async fn upgrade_to_active(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        pre_token: &LeaseToken,
    ) -> Result<Option<LeaseToken>> {
        let keys = CampaignKeys::new(campaign);
        let pre_member = LeasePhase::PreDial.member(call_id);
        let active_member = LeasePhase::Active.member(call_id);
        let active_token = LeaseToken::generate();
        let upgraded: Option<i64> = self
            .scripts
            .upgrade_to_active
            .key(keys.leases())
            .key(keys.lease(&pre_member))
            .key(keys.lease(&active_member))
            .arg(&pre_member)
            .arg(&active_member)
            .arg(pre_token.as_str())
            .arg(active_token.as_str())
            .arg(ACTIVE_LEASE_TTL.as_secs())
            .arg(self.now_ms())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(upgraded.map(|_| active_token))
    }

    async fn release_slot(
        &self,
        campaign: CampaignId,
        call_id: CallLogId,
        token: &LeaseToken,
        phase: LeasePhase,
        publish: bool,
    ) -> Result<ReleaseOutcome> {
        let keys = CampaignKeys::new(campaign);
        let member = phase.member(call_id);
        let outcome: String = self
            .scripts
            .release_slot
            .key(keys.leases())
            .key(keys.lease(&member))
            .arg(&member)
            .arg(token.as_str())
            .arg(SLOT_EVENTS_CHANNEL)
            .arg(campaign.to_string())
            .arg(if publish { "1" } else { "0" })
            .invoke_async(&mut self.conn())
            .await?;
        Ok(match outcome.as_str() {
            "released" => ReleaseOutcome::Released,
            "mismatch" => ReleaseOutcome::TokenMismatch,
            _ => ReleaseOutcome::AlreadyReleased,
        })
    }

    async fn waitlist_push(
        &self,
        campaign: CampaignId,
        lane: Lane,
        job_id: JobId,
        contact_id: crate::common::ContactId,
        marker_ttl: Duration,
        dedup_ttl: Duration,
    ) -> Result<WaitlistPush> {
        let keys = CampaignKeys::new(campaign);
        let raw: Vec<i64> = self
            .scripts
            .waitlist_push
            .key(keys.marker(job_id))
            .key(keys.waitlist(lane))
            .key(keys.seen())
            .arg(job_id.to_string())
            .arg(contact_id.to_string())
            .arg(marker_ttl.as_secs().max(1))
            .arg(dedup_ttl.as_secs().max(1))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(WaitlistPush {
            pushed: raw.first().copied().unwrap_or(0) == 1,
            duplicate_contact: raw.get(1).copied().unwrap_or(0) == 1,
        })
    }

    async fn waitlist_len(&self, campaign: CampaignId, lane: Lane) -> Result<u64> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        Ok(conn.llen(keys.waitlist(lane)).await?)
    }

    async fn waitlist_sample(
        &self,
        campaign: CampaignId,
        lane: Lane,
        count: usize,
    ) -> Result<Vec<JobId>> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .lrange(keys.waitlist(lane), 0, count as isize - 1)
            .await?;
        Ok(ids.iter().filter_map(|s| s.parse().ok()).collect())
    }

    async fn waitlist_remove(
        &self,
        campaign: CampaignId,
        lane: Lane,
        job_id: JobId,
    ) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let removed: i64 = conn
            .lrem(keys.waitlist(lane), 0, job_id.to_string())
            .await?;
        Ok(removed > 0)
    }

    async fn has_marker(&self, campaign: CampaignId, job_id: JobId) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        Ok(conn.exists(keys.marker(job_id)).await?)
    }

    async fn delete_marker(&self, campaign: CampaignId, job_id: JobId) -> Result<()> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        conn.del::<_, ()>(keys.marker(job_id)).await?;
        Ok(())
    }

    async fn queue_add(&self, job: &QueueJob) -> Result<bool> {
        let keys = CampaignKeys::new(job.campaign_id);
        let event = queue_event(job, super::QueueEventKind::Delayed);
        let added: i64 = self
            .scripts
            .queue_add
            .key(keys.job(job.id))
            .key(keys.delayed())
            .key(keys.job_index())
            .arg(serde_json::to_string(job)?)
            .arg(job.id.to_string())
            .arg(job.deliver_at_ms)
            .arg(QUEUE_EVENTS_CHANNEL)
            .arg(serde_json::to_string(&event)?)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(added == 1)
    }

    async fn queue_get(&self, campaign: CampaignId, job_id: JobId) -> Result<Option<QueueJob>> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys.job(job_id)).await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn queue_promote(&self, campaign: CampaignId, job_id: JobId, seq: i64) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let promoted: i64 = self
            .scripts
            .queue_promote
            .key(keys.job(job_id))
            .key(keys.delayed())
            .key(keys.waiting())
            .arg(job_id.to_string())
            .arg(seq)
            .arg(self.now_ms())
            .arg(QUEUE_EVENTS_CHANNEL)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(promoted == 1)
    }

    async fn queue_claim(&self, campaign: CampaignId) -> Result<Option<QueueJob>> {
        let keys = CampaignKeys::new(campaign);
        let raw: Option<String> = self
            .scripts
            .queue_claim
            .key(keys.waiting())
            .arg(keys.job_prefix())
            .arg(QUEUE_EVENTS_CHANNEL)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn queue_move_to_delayed(
        &self,
        campaign: CampaignId,
        job_id: JobId,
        deliver_at_ms: i64,
        bump_attempt: bool,
    ) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let moved: i64 = self
            .scripts
            .queue_move_to_delayed
            .key(keys.job(job_id))
            .key(keys.delayed())
            .key(keys.waiting())
            .arg(job_id.to_string())
            .arg(deliver_at_ms)
            .arg(if bump_attempt { "1" } else { "0" })
            .arg(QUEUE_EVENTS_CHANNEL)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(moved == 1)
    }

    async fn queue_update(&self, job: &QueueJob) -> Result<()> {
        let keys = CampaignKeys::new(job.campaign_id);
        let mut conn = self.conn();
        // XX so a concurrently removed job stays removed.
        let _: Option<String> = redis::cmd("SET")
            .arg(keys.job(job.id))
            .arg(serde_json::to_string(job)?)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn queue_finish(
        &self,
        campaign: CampaignId,
        job_id: JobId,
        state: JobState,
    ) -> Result<()> {
        let kind = match state {
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stalled => "stalled",
            _ => anyhow::bail!("queue_finish requires a settled state"),
        };
        let keys = CampaignKeys::new(campaign);
        let _: i64 = self
            .scripts
            .queue_finish
            .key(keys.job(job_id))
            .key(keys.delayed())
            .key(keys.waiting())
            .arg(job_id.to_string())
            .arg(kind)
            .arg(QUEUE_EVENTS_CHANNEL)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn queue_remove(&self, campaign: CampaignId, job_id: JobId) -> Result<bool> {
        let keys = CampaignKeys::new(campaign);
        let existed: i64 = self
            .scripts
            .queue_remove
            .key(keys.job(job_id))
            .key(keys.delayed())
            .key(keys.waiting())
            .key(keys.job_index())
            .arg(job_id.to_string())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(existed == 1)
    }

    async fn queue_state(&self, campaign: CampaignId, job_id: JobId) -> Result<Option<JobState>> {
        Ok(self.queue_get(campaign, job_id).await?.map(|j| j.state))
    }

    async fn queue_delayed_page(
        &self,
        campaign: CampaignId,
        count: usize,
    ) -> Result<Vec<JobId>> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .zrange(keys.delayed(), 0, count as isize - 1)
            .await?;
        Ok(ids.iter().filter_map(|s| s.parse().ok()).collect())
    }

    async fn queue_removable(&self, campaign: CampaignId) -> Result<Vec<JobId>> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(keys.job_index()).await?;
        let mut removable = Vec::new();
        for raw_id in ids {
            let Ok(job_id) = raw_id.parse::<JobId>() else {
                continue;
            };
            match self.queue_state(campaign, job_id).await? {
                Some(JobState::Active) => {}
                Some(_) => removable.push(job_id),
                // Index entry without a body is a leftover; let the cancel
                // sweep clean the index.
                None => removable.push(job_id),
            }
        }
        Ok(removable)
    }

    async fn slot_snapshot(&self, campaign: CampaignId) -> Result<SlotSnapshot> {
        let keys = CampaignKeys::new(campaign);
        let raw: Vec<String> = self
            .scripts
            .slot_snapshot
            .key(keys.limit())
            .key(keys.leases())
            .key(keys.reserved())
            .key(keys.ledger())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(SlotSnapshot {
            limit: raw.first().and_then(|s| s.parse().ok()).unwrap_or(0),
            inflight: raw.get(1).and_then(|s| s.parse().ok()).unwrap_or(0),
            reserved: raw.get(2).and_then(|s| s.parse().ok()).unwrap_or(0),
            ledger_len: raw.get(3).and_then(|s| s.parse().ok()).unwrap_or(0),
        })
    }

    async fn sweep_dead_members(&self, campaign: CampaignId) -> Result<u64> {
        let keys = CampaignKeys::new(campaign);
        let removed: u64 = self
            .scripts
            .sweep_dead_members
            .key(keys.leases())
            .arg(keys.lease_prefix())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(removed)
    }

    async fn orphan_member_count(&self, campaign: CampaignId) -> Result<u64> {
        let keys = CampaignKeys::new(campaign);
        let orphans: u64 = self
            .scripts
            .orphan_member_count
            .key(keys.leases())
            .arg(keys.lease_prefix())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(orphans)
    }

    async fn recover_orphan_reservations(
        &self,
        campaign: CampaignId,
        older_than: Duration,
    ) -> Result<Vec<PromotedEntry>> {
        let keys = CampaignKeys::new(campaign);
        let cutoff = self.now_ms() - older_than.as_millis() as i64;
        let members: Vec<String> = self
            .scripts
            .recover_orphans
            .key(keys.ledger())
            .key(keys.reserved())
            .key(keys.waitlist(Lane::High))
            .key(keys.waitlist(Lane::Normal))
            .arg(cutoff)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| parse_ledger_member(m))
            .collect())
    }

    async fn reconcile_reserved(&self, campaign: CampaignId) -> Result<(i64, u64)> {
        let keys = CampaignKeys::new(campaign);
        let raw: Vec<i64> = self
            .scripts
            .reconcile_reserved
            .key(keys.reserved())
            .key(keys.ledger())
            .invoke_async(&mut self.conn())
            .await?;
        Ok((
            raw.first().copied().unwrap_or(0),
            raw.get(1).copied().unwrap_or(0) as u64,
        ))
    }

    async fn breaker_get(&self, campaign: CampaignId) -> Result<Option<BreakerSnapshot>> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys.breaker()).await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn breaker_set(&self, campaign: CampaignId, snapshot: &BreakerSnapshot) -> Result<()> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        conn.set::<_, _, ()>(keys.breaker(), serde_json::to_string(snapshot)?)
            .await?;
        Ok(())
    }

    async fn cold_start_begin(&self, campaign: CampaignId, initial_limit: u32) -> Result<()> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(keys.cold_start(), "warming", WARMING_TTL.as_secs())
            .set(keys.cold_start_successes(), 0)
            .set(keys.limit(), initial_limit)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn cold_start_phase(&self, campaign: CampaignId) -> Result<Option<ColdStartPhase>> {
        let keys = CampaignKeys::new(campaign);
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys.cold_start()).await?;
        Ok(raw.as_deref().and_then(ColdStartPhase::parse))
    }

    async fn cold_start_note_success(
        &self,
        campaign: CampaignId,
        cold: &ColdStartConfig,
        configured_limit: u32,
    ) -> Result<Option<ColdStartPhase>> {
        let keys = CampaignKeys::new(campaign);
        let phase: Option<String> = self
            .scripts
            .cold_start_note_success
            .key(keys.cold_start())
            .key(keys.cold_start_successes())
            .key(keys.limit())
            .arg(cold.ramp_after_successes)
            .arg(cold.done_after_successes)
            .arg(cold.step_multiplier)
            .arg(configured_limit)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(phase.as_deref().and_then(ColdStartPhase::parse))
    }

    async fn cold_start_rewind(
        &self,
        campaign: CampaignId,
        cold: &ColdStartConfig,
        configured_limit: u32,
    ) -> Result<()> {
        let keys = CampaignKeys::new(campaign);
        let _: Option<String> = self
            .scripts
            .cold_start_rewind
            .key(keys.cold_start())
            .key(keys.cold_start_successes())
            .key(keys.limit())
            .arg(cold.initial_limit)
            .arg(configured_limit)
            .arg(cold.ramp_after_successes)
            .arg(WARMING_TTL.as_secs())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn publish_slot_available(&self, campaign: CampaignId) -> Result<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(SLOT_EVENTS_CHANNEL, campaign.to_string())
            .await?;
        Ok(())
    }

    fn subscribe_slots(&self) -> broadcast::Receiver<CampaignId> {
        self.slot_tx.subscribe()
    }

    fn subscribe_queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue_tx.subscribe()
    }

    async fn clear_campaign(&self, campaign: CampaignId) -> Result<()> {
        let keys = CampaignKeys::new(campaign);
        let _: i64 = self
            .scripts
            .clear_campaign
            .key(keys.limit())
            .key(keys.paused())
            .key(keys.leases())
            .key(keys.reserved())
            .key(keys.ledger())
            .key(keys.waitlist(Lane::High))
            .key(keys.waitlist(Lane::Normal))
            .key(keys.seen())
            .key(keys.gate())
            .key(keys.mutex())
            .key(keys.breaker())
            .key(keys.cold_start())
            .key(keys.cold_start_successes())
            .key(keys.delayed())
            .key(keys.waiting())
            .key(keys.job_index())
            .arg(keys.job_prefix())
            .arg(format!("dial:{{{campaign}}}:marker:"))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(())
    }
}

fn parse_ledger_member(member: &str) -> Option<PromotedEntry> {
    let (prefix, id) = member.split_once(':')?;
    Some(PromotedEntry {
        lane: Lane::from_ledger_prefix(prefix)?,
        job_id: id.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_member_parsing() {
        let job = JobId::new();
        let entry = parse_ledger_member(&format!("H:{job}")).unwrap();
        assert_eq!(entry.lane, Lane::High);
        assert_eq!(entry.job_id, job);

        assert!(parse_ledger_member("garbage").is_none());
        assert!(parse_ledger_member("X:not-a-uuid").is_none());
    }
}
