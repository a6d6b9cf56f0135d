//! Waitlist compactor: drops waitlisted ids whose job no longer exists or
//! has already settled, so dead entries cannot absorb promotions.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::common::CampaignId;
use crate::coordinator::{Coordinator, Lane};
use crate::domains::campaigns::store::CampaignStore;
use crate::kernel::{DialerKernel, Service};

/// Entries sampled per list per sweep.
const SAMPLE_SIZE: usize = 1000;

/// Removal cap per sweep; keeps the sweep bounded.
const MAX_REMOVALS: usize = 200;

pub struct WaitlistCompactor {
    kernel: Arc<DialerKernel>,
}

impl WaitlistCompactor {
    pub fn new(kernel: Arc<DialerKernel>) -> Self {
        Self { kernel }
    }

    pub async fn sweep(&self) -> Result<()> {
        let campaigns = self.kernel.store.list_active_campaigns().await?;
        let mut removed = 0usize;
        for campaign in &campaigns {
            for lane in [Lane::High, Lane::Normal] {
                removed += self.compact_lane(campaign.id, lane, removed).await?;
                if removed >= MAX_REMOVALS {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn compact_lane(
        &self,
        campaign: CampaignId,
        lane: Lane,
        already_removed: usize,
    ) -> Result<usize> {
        let coordinator = &self.kernel.coordinator;
        let sample = coordinator
            .waitlist_sample(campaign, lane, SAMPLE_SIZE)
            .await?;
        let mut removed = 0usize;

        for job_id in sample {
            if already_removed + removed >= MAX_REMOVALS {
                break;
            }
            let dead = match coordinator.queue_state(campaign, job_id).await? {
                None => true,
                Some(state) => state.is_settled(),
            };
            if dead && coordinator.waitlist_remove(campaign, lane, job_id).await? {
                coordinator.delete_marker(campaign, job_id).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(
                campaign_id = %campaign,
                lane = ?lane,
                count = removed,
                "compactor removed dead waitlist entries"
            );
        }
        Ok(removed)
    }
}

#[async_trait]
impl Service for WaitlistCompactor {
    fn name(&self) -> &'static str {
        "waitlist-compactor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.kernel.config.sweeps.compactor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "compactor sweep failed");
                    }
                }
            }
        }
        Ok(())
    }
}
