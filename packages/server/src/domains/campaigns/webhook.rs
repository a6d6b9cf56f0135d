//! Webhook-driven call finalisation.
//!
//! The worker owns initiation and upgrade; this handler owns everything
//! terminal: the call log outcome, the active lease release, the contact
//! status, and the campaign counters. The call log's `finalized_at` stamp
//! makes duplicate deliveries no-ops.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::common::CallLogId;
use crate::coordinator::LeaseToken;
use crate::dispatch::leases::release_active;
use crate::kernel::DialerKernel;

use super::store::CampaignStore;

use super::models::{CallLogStatus, CampaignStatus, ContactStatus, CounterDelta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// First delivery; outcome applied.
    Applied,
    /// Terminal outcome was already applied; no-op.
    Duplicate,
    /// No call log with this correlator.
    UnknownCall,
    /// Non-terminal status update recorded, nothing finalized.
    ProgressRecorded,
}

#[derive(Debug, Clone)]
pub struct CallStatusUpdate {
    pub status: CallLogStatus,
    pub duration_secs: Option<i32>,
    pub recording_url: Option<String>,
}

/// Apply one carrier status update to a call log.
pub async fn finalize_call(
    kernel: &Arc<DialerKernel>,
    call_log_id: CallLogId,
    update: CallStatusUpdate,
) -> Result<FinalizeOutcome> {
    let store = &kernel.store;
    let Some(log) = store.get_call_log(call_log_id).await? else {
        warn!(call_log_id = %call_log_id, "webhook for unknown call log");
        return Ok(FinalizeOutcome::UnknownCall);
    };

    if !update.status.is_terminal() {
        store.update_call_status(log.id, update.status).await?;
        return Ok(FinalizeOutcome::ProgressRecorded);
    }

    let first = store
        .finalize_call_log(
            log.id,
            update.status,
            update.duration_secs,
            update.recording_url.as_deref(),
        )
        .await?;
    if !first {
        debug!(call_log_id = %log.id, "duplicate terminal webhook ignored");
        return Ok(FinalizeOutcome::Duplicate);
    }

    // Release the active lease with the stored token. Missing tokens mean
    // the worker settled this attempt itself (never upgraded).
    if let Some(token) = &log.lease_token {
        release_active(
            &kernel.coordinator,
            log.campaign_id,
            log.id,
            &LeaseToken(token.clone()),
        )
        .await?;
    }

    // Contact outcome + campaign counters (single owner: this handler).
    let voicemail = update.status == CallLogStatus::Voicemail;
    let (contact_status, delta) = match update.status {
        CallLogStatus::Completed => (
            ContactStatus::Completed,
            CounterDelta {
                active: -1,
                completed: 1,
                ..Default::default()
            },
        ),
        CallLogStatus::Voicemail => (
            ContactStatus::Completed,
            CounterDelta {
                active: -1,
                voicemail: 1,
                ..Default::default()
            },
        ),
        _ => (
            ContactStatus::Failed,
            CounterDelta {
                active: -1,
                failed: 1,
                ..Default::default()
            },
        ),
    };
    store
        .finalize_contact(log.contact_id, contact_status, voicemail)
        .await?;
    store.apply_counter_delta(log.campaign_id, delta).await?;

    // Stamp retry eligibility for failed outcomes.
    if contact_status == ContactStatus::Failed {
        if let Some(campaign) = store.get_campaign(log.campaign_id).await? {
            let settings = campaign.settings.0.clone().clamped();
            if settings.retry_failed_calls {
                if let Some(contact) = store.get_contact(log.contact_id).await? {
                    if contact
                        .retry_allowed(settings.max_retry_attempts, settings.exclude_voicemail)
                    {
                        let next = chrono::Utc::now() + settings.retry_delay();
                        store.schedule_contact_retry(contact.id, next).await?;
                    }
                }
            }
        }
    }

    // Campaign completion: last settled call closes the campaign.
    if let Some(campaign) = store.get_campaign(log.campaign_id).await? {
        if campaign.status == CampaignStatus::Active && campaign.is_drained() {
            let completed = store
                .transition_campaign(
                    campaign.id,
                    &[CampaignStatus::Active],
                    CampaignStatus::Completed,
                )
                .await?;
            if completed {
                info!(campaign_id = %campaign.id, "campaign completed");
            }
        }
    }

    Ok(FinalizeOutcome::Applied)
}
