//! Counter reconciler: the ledger is the source of truth for `reserved`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::coordinator::Coordinator;
use crate::domains::campaigns::store::CampaignStore;
use crate::kernel::{DialerKernel, Service};

/// Drift beyond this is logged as critical.
const CRITICAL_DRIFT: i64 = 5;

pub struct CounterReconciler {
    kernel: Arc<DialerKernel>,
}

impl CounterReconciler {
    pub fn new(kernel: Arc<DialerKernel>) -> Self {
        Self { kernel }
    }

    pub async fn sweep(&self) -> Result<()> {
        let campaigns = self.kernel.store.list_active_campaigns().await?;
        for campaign in &campaigns {
            let (previous, ledger_len) = self
                .kernel
                .coordinator
                .reconcile_reserved(campaign.id)
                .await?;
            let drift = previous - ledger_len as i64;
            if drift == 0 {
                continue;
            }
            if drift.abs() > CRITICAL_DRIFT {
                error!(
                    campaign_id = %campaign.id,
                    previous,
                    ledger_len,
                    drift,
                    "critical reserved-counter drift corrected"
                );
            } else {
                warn!(
                    campaign_id = %campaign.id,
                    previous,
                    ledger_len,
                    drift,
                    "reserved counter drift corrected from ledger"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Service for CounterReconciler {
    fn name(&self) -> &'static str {
        "counter-reconciler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut interval =
            tokio::time::interval(self.kernel.config.sweeps.counter_reconciler_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "counter reconciler sweep failed");
                    }
                }
            }
        }
        Ok(())
    }
}
