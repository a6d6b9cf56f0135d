//! Campaign lifecycle API: start, pause, resume, cancel, contact ingestion,
//! and manual retry.
//!
//! Start publishes every pending contact into the deferred queue (parked,
//! not dialable) and seeds the campaign's concurrency ceiling; from there
//! the promoter owns admission entirely.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::common::{phone, CampaignId, UserId};
use crate::coordinator::Coordinator;
use crate::dispatch::{ColdStartControl, DialQueue};
use crate::kernel::DialerKernel;

use super::store::CampaignStore;

use super::models::{
    CampaignContact, CampaignStatus, ContactStatus, CounterDelta, NewContact, PriorityMode,
};

/// Contacts enqueued per batch on start.
const ENQUEUE_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum CampaignApiError {
    #[error("campaign not found")]
    NotFound,
    #[error("campaign belongs to another user")]
    Forbidden,
    #[error("campaign is already active")]
    AlreadyActive,
    #[error("campaign cannot start from status {0:?}")]
    NotStartable(CampaignStatus),
    #[error("campaign has no contacts")]
    NoContacts,
    #[error("campaign is not active")]
    NotActive,
    #[error("campaign is not paused")]
    NotPaused,
    #[error("campaign cannot be cancelled from status {0:?}")]
    NotCancellable(CampaignStatus),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, CampaignApiError>;

#[derive(Debug, Clone, Copy)]
pub struct StartReport {
    pub enqueued: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CancelReport {
    pub jobs_removed: u32,
    pub contacts_skipped: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryReport {
    pub enqueued: u32,
    pub refused: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestReport {
    pub inserted: u32,
    pub rejected: u32,
    pub enqueued: u32,
}

pub struct CampaignApi {
    kernel: Arc<DialerKernel>,
    queue: DialQueue,
    cold_start: ColdStartControl,
}

impl CampaignApi {
    pub fn new(kernel: Arc<DialerKernel>) -> Self {
        let queue = DialQueue::new(kernel.coordinator.clone());
        let cold_start =
            ColdStartControl::new(kernel.coordinator.clone(), kernel.config.cold_start.clone());
        Self {
            kernel,
            queue,
            cold_start,
        }
    }

    async fn owned_campaign(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
    ) -> ApiResult<super::models::Campaign> {
        let campaign = self
            .kernel
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or(CampaignApiError::NotFound)?;
        if campaign.user_id != user_id {
            return Err(CampaignApiError::Forbidden);
        }
        Ok(campaign)
    }

    /// Start (or restart from paused) a campaign: activate, seed the
    /// ceiling, enter cold start, and park every pending contact.
    pub async fn start(&self, campaign_id: CampaignId, user_id: UserId) -> ApiResult<StartReport> {
        let campaign = self.owned_campaign(campaign_id, user_id).await?;

        if campaign.status == CampaignStatus::Active {
            return Err(CampaignApiError::AlreadyActive);
        }
        if !campaign.status.is_startable() {
            return Err(CampaignApiError::NotStartable(campaign.status));
        }
        if campaign.total_contacts == 0 {
            return Err(CampaignApiError::NoContacts);
        }

        // CAS guards concurrent starts: exactly one caller wins.
        let transitioned = self
            .kernel
            .store
            .transition_campaign(
                campaign_id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Paused,
                ],
                CampaignStatus::Active,
            )
            .await?;
        if !transitioned {
            return Err(CampaignApiError::AlreadyActive);
        }

        let settings = campaign.settings.0.clone().clamped();
        let coordinator = &self.kernel.coordinator;
        coordinator
            .set_limit(campaign_id, settings.concurrent_calls_limit)
            .await
            .map_err(CampaignApiError::Internal)?;
        coordinator
            .set_paused(campaign_id, false)
            .await
            .map_err(CampaignApiError::Internal)?;
        self.cold_start
            .begin(campaign_id, settings.concurrent_calls_limit)
            .await?;

        let mut pending = self.kernel.store.pending_contacts(campaign_id).await?;
        order_for_mode(&mut pending, settings.priority_mode);

        let mut enqueued = 0u32;
        for batch in pending.chunks(ENQUEUE_BATCH) {
            for contact in batch {
                self.queue.park_contact(campaign_id, contact).await?;
                self.kernel
                    .store
                    .set_contact_status(contact.id, ContactStatus::Queued)
                    .await?;
                enqueued += 1;
            }
        }
        self.kernel
            .store
            .apply_counter_delta(campaign_id, CounterDelta::queued(enqueued as i32))
            .await?;

        info!(campaign_id = %campaign_id, enqueued, "campaign started");
        Ok(StartReport { enqueued })
    }

    /// Pause: block further promotion, let in-flight calls finish.
    pub async fn pause(&self, campaign_id: CampaignId, user_id: UserId) -> ApiResult<()> {
        self.owned_campaign(campaign_id, user_id).await?;
        let transitioned = self
            .kernel
            .store
            .transition_campaign(campaign_id, &[CampaignStatus::Active], CampaignStatus::Paused)
            .await?;
        if !transitioned {
            return Err(CampaignApiError::NotActive);
        }
        self.kernel
            .coordinator
            .set_paused(campaign_id, true)
            .await
            .map_err(CampaignApiError::Internal)?;
        info!(campaign_id = %campaign_id, "campaign paused");
        Ok(())
    }

    /// Resume a paused campaign and nudge the promoter.
    pub async fn resume(&self, campaign_id: CampaignId, user_id: UserId) -> ApiResult<()> {
        self.owned_campaign(campaign_id, user_id).await?;
        let transitioned = self
            .kernel
            .store
            .transition_campaign(campaign_id, &[CampaignStatus::Paused], CampaignStatus::Active)
            .await?;
        if !transitioned {
            return Err(CampaignApiError::NotPaused);
        }
        let coordinator = &self.kernel.coordinator;
        coordinator
            .set_paused(campaign_id, false)
            .await
            .map_err(CampaignApiError::Internal)?;
        coordinator
            .publish_slot_available(campaign_id)
            .await
            .map_err(CampaignApiError::Internal)?;
        info!(campaign_id = %campaign_id, "campaign resumed");
        Ok(())
    }

    /// Cancel: stop admission, drop queued work, skip unsettled contacts.
    /// In-flight calls are left to finish through the webhook.
    pub async fn cancel(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
    ) -> ApiResult<CancelReport> {
        let campaign = self.owned_campaign(campaign_id, user_id).await?;
        let transitioned = self
            .kernel
            .store
            .transition_campaign(
                campaign_id,
                &[
                    CampaignStatus::Active,
                    CampaignStatus::Paused,
                    CampaignStatus::Scheduled,
                ],
                CampaignStatus::Cancelled,
            )
            .await?;
        if !transitioned {
            return Err(CampaignApiError::NotCancellable(campaign.status));
        }

        let coordinator = &self.kernel.coordinator;
        coordinator
            .set_paused(campaign_id, true)
            .await
            .map_err(CampaignApiError::Internal)?;

        let mut jobs_removed = 0u32;
        let removable = coordinator
            .queue_removable(campaign_id)
            .await
            .map_err(CampaignApiError::Internal)?;
        for job_id in removable {
            match coordinator.queue_remove(campaign_id, job_id).await {
                Ok(true) => jobs_removed += 1,
                Ok(false) => {}
                Err(e) => warn!(campaign_id = %campaign_id, job_id = %job_id, error = %e,
                    "failed to remove job during cancel"),
            }
        }

        let contacts_skipped = self.kernel.store.skip_unsettled_contacts(campaign_id).await?;
        coordinator
            .clear_campaign(campaign_id)
            .await
            .map_err(CampaignApiError::Internal)?;

        info!(
            campaign_id = %campaign_id,
            jobs_removed,
            contacts_skipped,
            "campaign cancelled"
        );
        Ok(CancelReport {
            jobs_removed,
            contacts_skipped,
        })
    }

    /// Ingest contacts; when the campaign is already active the new
    /// contacts are parked immediately.
    pub async fn add_contacts(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
        contacts: Vec<NewContact>,
    ) -> ApiResult<IngestReport> {
        let campaign = self.owned_campaign(campaign_id, user_id).await?;

        let mut valid = Vec::with_capacity(contacts.len());
        let mut rejected = 0u32;
        for mut contact in contacts {
            contact.phone_number = phone::normalize(&contact.phone_number);
            if phone::is_e164(&contact.phone_number) {
                valid.push(contact);
            } else {
                rejected += 1;
            }
        }

        let inserted = self.kernel.store.insert_contacts(campaign_id, &valid).await?;

        let mut enqueued = 0u32;
        if campaign.status == CampaignStatus::Active {
            let pending = self.kernel.store.pending_contacts(campaign_id).await?;
            for contact in &pending {
                self.queue.park_contact(campaign_id, contact).await?;
                self.kernel
                    .store
                    .set_contact_status(contact.id, ContactStatus::Queued)
                    .await?;
                enqueued += 1;
            }
            if enqueued > 0 {
                self.kernel
                    .store
                    .apply_counter_delta(campaign_id, CounterDelta::queued(enqueued as i32))
                    .await?;
            }
        }

        Ok(IngestReport {
            inserted,
            rejected,
            enqueued,
        })
    }

    /// Manual retry of failed contacts. Refuses contacts at their retry cap
    /// and voicemail-marked contacts when the campaign excludes voicemail.
    pub async fn retry_failed(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
    ) -> ApiResult<RetryReport> {
        let campaign = self.owned_campaign(campaign_id, user_id).await?;
        if campaign.status != CampaignStatus::Active {
            return Err(CampaignApiError::NotActive);
        }
        let settings = campaign.settings.0.clone().clamped();

        let failed = self.kernel.store.failed_contacts(campaign_id).await?;
        let mut enqueued = 0u32;
        let mut refused = 0u32;

        for contact in failed {
            if !contact.retry_allowed(settings.max_retry_attempts, settings.exclude_voicemail) {
                refused += 1;
                continue;
            }
            if !self.kernel.store.begin_contact_retry(contact.id).await? {
                continue;
            }
            self.queue.park_contact(campaign_id, &contact).await?;
            self.kernel
                .store
                .apply_counter_delta(
                    campaign_id,
                    CounterDelta {
                        queued: 1,
                        failed: -1,
                        ..Default::default()
                    },
                )
                .await?;
            enqueued += 1;
        }

        info!(campaign_id = %campaign_id, enqueued, refused, "manual retry enqueued");
        Ok(RetryReport { enqueued, refused })
    }
}

/// Order pending contacts per the campaign's priority mode. The store
/// already returns (priority desc, created asc).
fn order_for_mode(contacts: &mut [CampaignContact], mode: PriorityMode) {
    match mode {
        PriorityMode::Fifo | PriorityMode::Priority => {}
        PriorityMode::Lifo => {
            contacts.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(b.created_at.cmp(&a.created_at))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn contact_created_at(minutes_ago: i64) -> CampaignContact {
        let mut c = CampaignContact::builder()
            .campaign_id(CampaignId::new())
            .phone_number(format!("+9198765432{minutes_ago:02}"))
            .build();
        c.created_at = Utc::now() - Duration::minutes(minutes_ago);
        c
    }

    #[test]
    fn lifo_reverses_creation_order() {
        let older = contact_created_at(10);
        let newer = contact_created_at(1);
        let mut contacts = vec![older.clone(), newer.clone()];

        order_for_mode(&mut contacts, PriorityMode::Lifo);
        assert_eq!(contacts[0].id, newer.id);

        let mut contacts = vec![older.clone(), newer.clone()];
        order_for_mode(&mut contacts, PriorityMode::Fifo);
        assert_eq!(contacts[0].id, older.id);
    }
}
