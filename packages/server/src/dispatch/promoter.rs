//! Promoter: the admission-control loop.
//!
//! At most one promoter runs per campaign at a time (coordinator mutex,
//! renewed while held). Each tick atomically reserves slots under the
//! ceiling, pops waitlisted job ids, and promotes the jobs to waiting.
//! Promotion failures give their slot back immediately; repeated failures
//! trip a per-campaign circuit breaker that shrinks the batch to one while
//! open, but never stops admission entirely.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::CampaignId;
use crate::coordinator::{BreakerSnapshot, BreakerState, Coordinator};
use crate::domains::campaigns::models::{Campaign, CampaignStatus};
use crate::domains::campaigns::store::CampaignStore;
use crate::kernel::{DialerKernel, Service};

const MUTEX_TTL: Duration = Duration::from_secs(5);
const MUTEX_RENEW_EVERY: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_JITTER_MS: u64 = 1000;

const DEFAULT_BATCH: u32 = 5;
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_WINDOW_MS: i64 = 30_000;
const BREAKER_OPEN_MS: i64 = 60_000;

pub struct Promoter {
    kernel: Arc<DialerKernel>,
    /// Mutex holder id for this instance.
    holder: String,
    batch_size: u32,
}

impl Promoter {
    pub fn new(kernel: Arc<DialerKernel>) -> Self {
        Self {
            kernel,
            holder: format!("promoter-{}", uuid::Uuid::new_v4()),
            batch_size: DEFAULT_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// One promotion attempt for one campaign. Safe to call from multiple
    /// instances; the mutex serialises actual work.
    pub async fn promote_campaign(&self, campaign: &Campaign) -> Result<()> {
        let coordinator = &self.kernel.coordinator;
        let id = campaign.id;

        if coordinator.is_paused(id).await? {
            return Ok(());
        }

        let now = coordinator.now_ms();
        let breaker = coordinator
            .breaker_get(id)
            .await?
            .unwrap_or_else(|| BreakerSnapshot::closed(now));
        let batch_size = match breaker.state {
            BreakerState::Open if now - breaker.opened_at_ms < BREAKER_OPEN_MS => 1,
            _ => self.batch_size,
        };

        if !coordinator
            .acquire_promoter_mutex(id, &self.holder, MUTEX_TTL)
            .await?
        {
            return Ok(());
        }

        // Keep the mutex alive while we work.
        let renew_stop = CancellationToken::new();
        {
            let coordinator = coordinator.clone();
            let holder = self.holder.clone();
            let stop = renew_stop.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MUTEX_RENEW_EVERY);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = coordinator
                                .renew_promoter_mutex(id, &holder, MUTEX_TTL)
                                .await
                            {
                                warn!(campaign_id = %id, error = %e, "mutex renew failed");
                            }
                        }
                    }
                }
            });
        }

        let outcome = self.promote_locked(campaign, batch_size).await;

        renew_stop.cancel();
        if let Err(e) = coordinator.release_promoter_mutex(id, &self.holder).await {
            warn!(campaign_id = %id, error = %e, "mutex release failed; TTL will clear it");
        }

        let (successes, failures) = outcome?;
        if successes > 0 || failures > 0 {
            self.note_outcomes(id, breaker, successes, failures).await?;
        }
        Ok(())
    }

    async fn promote_locked(&self, campaign: &Campaign, batch_size: u32) -> Result<(u32, u32)> {
        let coordinator = &self.kernel.coordinator;
        let id = campaign.id;

        let limit = match coordinator.get_limit(id).await? {
            Some(limit) => limit,
            None => campaign.settings.0.clone().clamped().concurrent_calls_limit,
        };

        let batch = coordinator.pop_reserve_promote(id, limit, batch_size).await?;
        if batch.count() == 0 {
            return Ok((0, 0));
        }
        debug!(
            campaign_id = %id,
            count = batch.count(),
            seq = batch.seq,
            "reserved slots for promotion"
        );

        let mut successes = 0u32;
        let mut failures = 0u32;
        for entry in &batch.entries {
            let promoted = coordinator.queue_promote(id, entry.job_id, batch.seq).await;
            match promoted {
                Ok(true) => successes += 1,
                Ok(false) => {
                    // Missing or already-settled job: the slot must not leak.
                    coordinator.claim_reservation(id, entry.job_id).await?;
                    failures += 1;
                    debug!(campaign_id = %id, job_id = %entry.job_id, "promotion skipped a dead job");
                }
                Err(e) => {
                    coordinator.claim_reservation(id, entry.job_id).await?;
                    failures += 1;
                    warn!(campaign_id = %id, job_id = %entry.job_id, error = %e, "promotion failed");
                }
            }
        }
        Ok((successes, failures))
    }

    /// Fold this tick's outcomes into the shared breaker snapshot.
    async fn note_outcomes(
        &self,
        campaign: CampaignId,
        mut breaker: BreakerSnapshot,
        successes: u32,
        failures: u32,
    ) -> Result<()> {
        let coordinator = &self.kernel.coordinator;
        let now = coordinator.now_ms();

        if successes > 0 {
            breaker = match breaker.state {
                BreakerState::Open => BreakerSnapshot {
                    state: BreakerState::HalfOpen,
                    failures: 0,
                    window_start_ms: now,
                    opened_at_ms: breaker.opened_at_ms,
                },
                _ => BreakerSnapshot::closed(now),
            };
        }

        if failures > 0 {
            if now - breaker.window_start_ms > BREAKER_WINDOW_MS {
                breaker.window_start_ms = now;
                breaker.failures = 0;
            }
            breaker.failures += failures;
            let should_open = breaker.failures >= BREAKER_THRESHOLD
                || breaker.state == BreakerState::HalfOpen;
            if should_open {
                info!(campaign_id = %campaign, failures = breaker.failures, "promotion breaker opened");
                breaker.state = BreakerState::Open;
                breaker.opened_at_ms = now;
            }
        }

        coordinator.breaker_set(campaign, &breaker).await
    }

    async fn sweep(&self) {
        let campaigns = match self.kernel.store.list_active_campaigns().await {
            Ok(campaigns) => campaigns,
            Err(e) => {
                warn!(error = %e, "failed to list active campaigns");
                return;
            }
        };
        for campaign in campaigns {
            if let Err(e) = self.promote_campaign(&campaign).await {
                warn!(campaign_id = %campaign.id, error = %e, "promoter tick failed");
            }
        }
    }

    async fn wake(&self, campaign_id: CampaignId) {
        let campaign = match self.kernel.store.get_campaign(campaign_id).await {
            Ok(Some(campaign)) if campaign.status == CampaignStatus::Active => campaign,
            Ok(_) => return,
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "failed to load campaign for wake");
                return;
            }
        };
        if let Err(e) = self.promote_campaign(&campaign).await {
            warn!(campaign_id = %campaign_id, error = %e, "slot-available promotion failed");
        }
    }
}

#[async_trait]
impl Service for Promoter {
    fn name(&self) -> &'static str {
        "promoter"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut slots = self.kernel.coordinator.subscribe_slots();
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    // Jitter so a fleet of instances doesn't sweep in step.
                    let jitter = Duration::from_millis(fastrand::u64(0..POLL_JITTER_MS));
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(jitter) => {}
                    }
                    self.sweep().await;
                }
                received = slots.recv() => match received {
                    Ok(campaign_id) => self.wake(campaign_id).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "promoter lagged behind slot events; poller will catch up");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
}
