//! Queue reconciler: re-creates waitlist entries for delayed jobs whose
//! marker was lost (dropped `delayed` events, crashed syncer).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::{Coordinator, JobState};
use crate::domains::campaigns::store::CampaignStore;
use crate::kernel::{DialerKernel, Service};

/// Delayed jobs examined per campaign per sweep.
const PAGE_SIZE: usize = 500;

pub struct QueueReconciler {
    kernel: Arc<DialerKernel>,
}

impl QueueReconciler {
    pub fn new(kernel: Arc<DialerKernel>) -> Self {
        Self { kernel }
    }

    pub async fn sweep(&self) -> Result<()> {
        let coordinator = &self.kernel.coordinator;
        let sweeps = &self.kernel.config.sweeps;
        let campaigns = self.kernel.store.list_active_campaigns().await?;

        for campaign in &campaigns {
            let delayed = coordinator.queue_delayed_page(campaign.id, PAGE_SIZE).await?;
            let mut recovered = 0usize;

            for job_id in delayed {
                if coordinator.has_marker(campaign.id, job_id).await? {
                    continue;
                }
                let Some(job) = coordinator.queue_get(campaign.id, job_id).await? else {
                    continue;
                };
                if job.state != JobState::Delayed {
                    continue;
                }
                let push = coordinator
                    .waitlist_push(
                        campaign.id,
                        job.lane,
                        job.id,
                        job.contact_id,
                        sweeps.marker_ttl,
                        sweeps.dedup_ttl,
                    )
                    .await?;
                if push.pushed {
                    recovered += 1;
                }
            }

            if recovered > 0 {
                info!(
                    campaign_id = %campaign.id,
                    count = recovered,
                    "queue reconciler restored dropped waitlist entries"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Service for QueueReconciler {
    fn name(&self) -> &'static str {
        "queue-reconciler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut interval =
            tokio::time::interval(self.kernel.config.sweeps.queue_reconciler_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "queue reconciler sweep failed");
                    }
                }
            }
        }
        Ok(())
    }
}
