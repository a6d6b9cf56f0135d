//! Deferred dial-job queue semantics.
//!
//! Jobs are always parked with a long default delay; they never become
//! `waiting` on their own. The promoter is the only admission path, which is
//! what moves capacity enforcement out of worker concurrency tuning and into
//! the slot engine. Retries re-enter through the same park so the promoter
//! keeps full control; per-attempt retry delay is enforced upstream through
//! the contact's `next_retry_at` eligibility stamp.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::common::{CampaignId, JobId};
use crate::coordinator::{Coordinator, Lane, QueueJob};
use crate::domains::campaigns::models::CampaignContact;

/// Default park delay. Jobs sit delayed far in the future until promoted.
pub const DEFAULT_PARK_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Base delay for attempt backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Exponential backoff for the next attempt, capped at an hour.
pub fn retry_backoff(attempts_made: u32) -> Duration {
    let secs = BACKOFF_BASE
        .as_secs()
        .saturating_mul(1u64 << attempts_made.min(12));
    Duration::from_secs(secs.min(3600))
}

/// Which waitlist a contact's jobs go to.
pub fn lane_for(contact: &CampaignContact) -> Lane {
    if contact.priority > 0 {
        Lane::High
    } else {
        Lane::Normal
    }
}

/// Domain-level facade over the coordinator's queue operations.
pub struct DialQueue {
    coordinator: Arc<dyn Coordinator>,
}

impl DialQueue {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Park one dial attempt for a contact. The `delayed` event this emits
    /// is what feeds the waitlist syncer.
    pub async fn park_contact(
        &self,
        campaign: CampaignId,
        contact: &CampaignContact,
    ) -> Result<JobId> {
        let deliver_at = self.coordinator.now_ms() + DEFAULT_PARK_DELAY.as_millis() as i64;
        let job = QueueJob::park(campaign, contact.id, lane_for(contact), deliver_at);
        let job_id = job.id;
        self.coordinator.queue_add(&job).await?;
        debug!(
            campaign_id = %campaign,
            job_id = %job_id,
            contact_id = %contact.id,
            lane = ?job.lane,
            "parked dial job"
        );
        Ok(job_id)
    }

    /// Re-park a claimed job for a later attempt, bumping the attempt
    /// counter.
    pub async fn park_for_retry(&self, campaign: CampaignId, job: &QueueJob) -> Result<()> {
        let deliver_at =
            self.coordinator.now_ms() + retry_backoff(job.attempts_made).as_millis() as i64;
        self.coordinator
            .queue_move_to_delayed(campaign, job.id, deliver_at, true)
            .await?;
        Ok(())
    }

    /// Re-park a job without consuming an attempt (pause, stale gate).
    pub async fn park_again(
        &self,
        campaign: CampaignId,
        job_id: JobId,
        delay: Duration,
    ) -> Result<()> {
        let deliver_at = self.coordinator.now_ms() + delay.as_millis() as i64;
        self.coordinator
            .queue_move_to_delayed(campaign, job_id, deliver_at, false)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_secs(30));
        assert_eq!(retry_backoff(1), Duration::from_secs(60));
        assert_eq!(retry_backoff(2), Duration::from_secs(120));
        assert_eq!(retry_backoff(20), Duration::from_secs(3600));
    }

    #[test]
    fn positive_priority_selects_high_lane() {
        let contact = CampaignContact::builder()
            .campaign_id(CampaignId::new())
            .phone_number("+919876543210")
            .priority(5)
            .build();
        assert_eq!(lane_for(&contact), Lane::High);

        let contact = CampaignContact::builder()
            .campaign_id(CampaignId::new())
            .phone_number("+919876543211")
            .build();
        assert_eq!(lane_for(&contact), Lane::Normal);
    }
}
