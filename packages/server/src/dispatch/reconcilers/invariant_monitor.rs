//! Invariant monitor: evaluates the capacity, ledger, orphan, and
//! saturation invariants per active campaign and emits metrics.
//!
//! Violations are reported, never auto-remediated: killing live calls to
//! satisfy a counter is worse than the drift, and the other reconcilers
//! correct drift on their own cadence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::CampaignId;
use crate::coordinator::Coordinator;
use crate::domains::campaigns::store::CampaignStore;
use crate::kernel::{DialerKernel, Service};

/// Saturation above this is an overshoot.
const SATURATION_WARN: f64 = 1.05;

/// Saturation above this is critical immediately.
const SATURATION_CRITICAL: f64 = 1.10;

/// How long an overshoot may persist before it pages.
const SUSTAINED_FOR: Duration = Duration::from_secs(10);

pub struct InvariantMonitor {
    kernel: Arc<DialerKernel>,
    /// First time each campaign was seen above the warn threshold.
    overshoot_since: std::sync::Mutex<HashMap<CampaignId, Instant>>,
}

impl InvariantMonitor {
    pub fn new(kernel: Arc<DialerKernel>) -> Self {
        Self {
            kernel,
            overshoot_since: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn sweep(&self) -> Result<()> {
        let campaigns = self.kernel.store.list_active_campaigns().await?;
        for campaign in &campaigns {
            if let Err(e) = self.check_campaign(campaign.id).await {
                warn!(campaign_id = %campaign.id, error = %e, "invariant check failed");
            }
        }
        Ok(())
    }

    async fn check_campaign(&self, campaign: CampaignId) -> Result<()> {
        let coordinator = &self.kernel.coordinator;
        let snapshot = coordinator.slot_snapshot(campaign).await?;
        let orphans = coordinator.orphan_member_count(campaign).await?;
        let saturation = snapshot.saturation();

        info!(
            campaign_id = %campaign,
            inflight_calls = snapshot.inflight,
            reserved_slots = snapshot.reserved,
            limit = snapshot.limit,
            saturation,
            "slot metrics"
        );

        // Capacity: |leases| + reserved <= limit + 1, always.
        if snapshot.capacity_exceeded() {
            error!(
                campaign_id = %campaign,
                inflight = snapshot.inflight,
                reserved = snapshot.reserved,
                limit = snapshot.limit,
                invariant = "capacity",
                "CRITICAL: capacity invariant violated"
            );
        }

        // Ledger consistency: reserved == |ledger|.
        if snapshot.reserved != snapshot.ledger_len as i64 {
            warn!(
                campaign_id = %campaign,
                reserved = snapshot.reserved,
                ledger_len = snapshot.ledger_len,
                invariant = "ledger",
                "reserved counter disagrees with ledger"
            );
        }

        // Orphan members: tolerated only within the janitor window.
        if orphans > 0 {
            warn!(
                campaign_id = %campaign,
                orphans,
                invariant = "orphans",
                "lease members without live lease keys"
            );
        }

        // Saturation, with a sustained-overshoot window.
        let mut overshoots = self.overshoot_since.lock().expect("monitor state poisoned");
        if saturation > SATURATION_WARN {
            let since = *overshoots.entry(campaign).or_insert_with(Instant::now);
            if saturation > SATURATION_CRITICAL {
                error!(
                    campaign_id = %campaign,
                    saturation,
                    invariant = "saturation",
                    "CRITICAL: saturation above 1.10"
                );
            } else if since.elapsed() >= SUSTAINED_FOR {
                error!(
                    campaign_id = %campaign,
                    saturation,
                    sustained_secs = since.elapsed().as_secs(),
                    invariant = "saturation",
                    "saturation overshoot sustained; paging"
                );
            } else {
                warn!(
                    campaign_id = %campaign,
                    saturation,
                    invariant = "saturation",
                    "transient saturation overshoot"
                );
            }
        } else {
            overshoots.remove(&campaign);
        }
        Ok(())
    }
}

#[async_trait]
impl Service for InvariantMonitor {
    fn name(&self) -> &'static str {
        "invariant-monitor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.kernel.config.sweeps.invariant_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "invariant monitor sweep failed");
                    }
                }
            }
        }
        Ok(())
    }
}
