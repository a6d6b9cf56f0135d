//! Lease janitor: removes lease members whose TTL key has expired and
//! recovers reservations stranded by crashed promoters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::domains::campaigns::store::CampaignStore;
use crate::kernel::{DialerKernel, Service};

/// Campaigns swept per tick.
const MAX_CAMPAIGNS: usize = 100;

/// Wall-clock budget per sweep.
const SWEEP_BUDGET: Duration = Duration::from_secs(5);

pub struct LeaseJanitor {
    kernel: Arc<DialerKernel>,
}

impl LeaseJanitor {
    pub fn new(kernel: Arc<DialerKernel>) -> Self {
        Self { kernel }
    }

    pub async fn sweep(&self) -> Result<()> {
        let started = Instant::now();
        let orphan_age = self.kernel.config.sweeps.reservation_orphan_age;
        let campaigns = self.kernel.store.list_active_campaigns().await?;

        for campaign in campaigns.iter().take(MAX_CAMPAIGNS) {
            if started.elapsed() > SWEEP_BUDGET {
                warn!("janitor sweep budget exhausted; remaining campaigns deferred");
                break;
            }
            let coordinator = &self.kernel.coordinator;

            // Member cleanup is deferred while a campaign is still ramping:
            // early expiries there are usually in-flight upgrades.
            let defers = coordinator
                .cold_start_phase(campaign.id)
                .await?
                .map(|phase| phase.defers_janitor())
                .unwrap_or(false);
            if !defers {
                let cleaned = coordinator.sweep_dead_members(campaign.id).await?;
                if cleaned > 0 {
                    info!(
                        campaign_id = %campaign.id,
                        metric = "stale_members_cleaned",
                        count = cleaned,
                        "janitor removed dead lease members"
                    );
                }
            }

            let recovered = coordinator
                .recover_orphan_reservations(campaign.id, orphan_age)
                .await?;
            if !recovered.is_empty() {
                info!(
                    campaign_id = %campaign.id,
                    metric = "orphaned_reservations_recovered",
                    count = recovered.len(),
                    "janitor requeued orphaned reservations"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Service for LeaseJanitor {
    fn name(&self) -> &'static str {
        "lease-janitor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.kernel.config.sweeps.janitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "janitor sweep failed");
                    }
                }
            }
        }
        Ok(())
    }
}
