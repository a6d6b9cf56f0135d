//! Scheduled retry sweep using tokio-cron-scheduler.
//!
//! Failed contacts carry a `next_retry_at` eligibility stamp written by the
//! webhook handler. This sweep runs on a cron cadence and, inside the
//! configured off-peak window, re-enqueues due contacts through the normal
//! park-then-promote pipeline. The park delay stays at the long default so
//! the promoter remains the only admission path for retries too.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::domains::campaigns::models::CounterDelta;
use crate::domains::campaigns::store::CampaignStore;
use crate::kernel::DialerKernel;

use super::queue::DialQueue;

/// Start the retry scheduler: sweeps every 10 minutes.
pub async fn start_retry_scheduler(kernel: Arc<DialerKernel>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let sweep_kernel = kernel.clone();
    let retry_job = Job::new_async("0 */10 * * * *", move |_uuid, _lock| {
        let kernel = sweep_kernel.clone();
        Box::pin(async move {
            match run_retry_sweep(&kernel).await {
                Ok(0) => {}
                Ok(count) => info!(count, "retry sweep enqueued contacts"),
                Err(e) => warn!(error = %e, "retry sweep failed"),
            }
        })
    })?;

    scheduler.add(retry_job).await?;
    scheduler.start().await?;

    info!("retry scheduler started (every 10 minutes, off-peak gated)");
    Ok(scheduler)
}

/// One retry sweep. Returns the number of contacts re-enqueued.
pub async fn run_retry_sweep(kernel: &Arc<DialerKernel>) -> Result<u32> {
    let now = Utc::now();
    if !kernel.config.off_peak.contains(now) {
        return Ok(0);
    }

    let queue = DialQueue::new(kernel.coordinator.clone());
    let campaigns = kernel.store.list_active_campaigns().await?;
    let mut enqueued = 0u32;

    for campaign in &campaigns {
        let settings = campaign.settings.0.clone().clamped();
        if !settings.retry_failed_calls {
            continue;
        }

        let due = kernel.store.contacts_due_for_retry(campaign.id, now).await?;
        for contact in due {
            if !contact.retry_allowed(settings.max_retry_attempts, settings.exclude_voicemail) {
                continue;
            }
            if !kernel.store.begin_contact_retry(contact.id).await? {
                continue;
            }
            queue.park_contact(campaign.id, &contact).await?;
            kernel
                .store
                .apply_counter_delta(
                    campaign.id,
                    CounterDelta {
                        queued: 1,
                        failed: -1,
                        ..Default::default()
                    },
                )
                .await?;
            enqueued += 1;
        }
    }
    Ok(enqueued)
}
