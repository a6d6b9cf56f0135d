//! Waitlist syncer: bridges queue lifecycle events into the per-campaign
//! priority waitlists.
//!
//! On `delayed` the job id is pushed into its lane exactly once, guarded by
//! the marker key (NX + TTL); on every other lifecycle edge the marker is
//! deleted. Duplicate events are therefore harmless in both directions.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, QueueEvent, QueueEventKind};
use crate::kernel::{DialerKernel, Service};

pub struct WaitlistSyncer {
    kernel: Arc<DialerKernel>,
}

impl WaitlistSyncer {
    pub fn new(kernel: Arc<DialerKernel>) -> Self {
        Self { kernel }
    }

    /// Apply one queue lifecycle event. Public so tests can drive the
    /// sync deterministically without the service loop.
    pub async fn apply(&self, event: QueueEvent) -> Result<()> {
        let coordinator = &self.kernel.coordinator;
        match event.kind {
            QueueEventKind::Delayed => {
                let push = coordinator
                    .waitlist_push(
                        event.campaign_id,
                        event.lane,
                        event.job_id,
                        event.contact_id,
                        self.kernel.config.sweeps.marker_ttl,
                        self.kernel.config.sweeps.dedup_ttl,
                    )
                    .await?;
                if push.duplicate_contact {
                    // Expected to be deduped at contact creation; count it
                    // but keep the enqueue.
                    warn!(
                        campaign_id = %event.campaign_id,
                        contact_id = %event.contact_id,
                        metric = "duplicate_enqueue",
                        "contact enqueued more than once"
                    );
                }
                if push.pushed {
                    debug!(
                        campaign_id = %event.campaign_id,
                        job_id = %event.job_id,
                        lane = ?event.lane,
                        "job added to waitlist"
                    );
                }
            }
            QueueEventKind::Waiting
            | QueueEventKind::Active
            | QueueEventKind::Completed
            | QueueEventKind::Failed
            | QueueEventKind::Stalled => {
                coordinator
                    .delete_marker(event.campaign_id, event.job_id)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Service for WaitlistSyncer {
    fn name(&self) -> &'static str {
        "waitlist-syncer"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut events = self.kernel.coordinator.subscribe_queue_events();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.apply(event).await {
                            warn!(error = %e, "waitlist sync failed; queue reconciler will repair");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Dropped events are recovered by the queue
                        // reconciler's marker sweep.
                        warn!(missed, "waitlist syncer lagged behind queue events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
}
