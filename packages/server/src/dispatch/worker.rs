//! Call worker: consumes promoted jobs and drives the carrier.
//!
//! One claimed job is processed at a time per instance; capacity is enforced
//! entirely by the lease engine, not by worker concurrency. The worker owns
//! initiation and the pre-dial → active upgrade only; terminal outcomes for
//! answered calls arrive out of band through the webhook handler, which is
//! the single owner of contact finalisation for them (no double counting).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, QueueJob};
use crate::domains::campaigns::models::{
    CallLog, CallLogStatus, Campaign, CampaignContact, CampaignStatus, ContactStatus,
    CounterDelta,
};
use crate::domains::campaigns::store::CampaignStore;
use crate::kernel::{Carrier, DialRequest, DialerKernel, PhoneDirectory, Service};

use super::cold_start::ColdStartControl;
use super::leases::PreDialScope;
use super::queue::{DialQueue, DEFAULT_PARK_DELAY};

/// Idle poll while no waiting jobs exist anywhere.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A promotion stamp older than this is stale; the worker refuses to dial.
const STALE_PROMOTION_MS: i64 = 15_000;

/// How far the promote-gate may advance past a job's stamp before the job
/// is considered admitted under a stale ceiling.
const STALE_GATE_LAG: i64 = 10;

/// Gate repairs before a job is hard-synced back through the waitlist.
const MAX_GATE_REPAIRS: u32 = 5;

/// Re-park delay for gate repairs and cold-start blocking.
const SHORT_REPARK: Duration = Duration::from_secs(5);

/// How long to wait for the carrier status to advance after initiate.
const STATUS_POLLS: u32 = 3;
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct CallWorker {
    kernel: Arc<DialerKernel>,
    queue: DialQueue,
    cold_start: ColdStartControl,
}

impl CallWorker {
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

    /// Claim and process at most one job across the active campaigns.
    /// Returns true when a job was worked.
    pub async fn tick(&self) -> Result<bool> {
        let campaigns = self.kernel.store.list_active_campaigns().await?;
        for campaign in &campaigns {
            let claimed = self.kernel.coordinator.queue_claim(campaign.id).await?;
            if let Some(job) = claimed {
                if let Err(e) = self.process(campaign, job).await {
                    warn!(campaign_id = %campaign.id, error = %e, "dial attempt errored");
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn process(&self, campaign: &Campaign, job: QueueJob) -> Result<()> {
        let coordinator = &self.kernel.coordinator;
        let settings = campaign.settings.0.clone().clamped();
        let configured_limit = settings.concurrent_calls_limit;

        // Paused or no-longer-active campaigns abandon the slot and re-park
        // the job without consuming an attempt.
        if campaign.status != CampaignStatus::Active
            || coordinator.is_paused(campaign.id).await?
        {
            coordinator.claim_reservation(campaign.id, job.id).await?;
            self.queue
                .park_again(campaign.id, job.id, DEFAULT_PARK_DELAY)
                .await?;
            debug!(campaign_id = %campaign.id, job_id = %job.id, "re-parked job for paused campaign");
            return Ok(());
        }

        // Promotion-gate freshness: refuse jobs admitted under a stale
        // ceiling or promoted too long ago.
        if self.promotion_is_stale(campaign, &job).await? {
            self.repair_gate(campaign, job).await?;
            return Ok(());
        }

        // Cold-start guard: while warming, a single call is in flight.
        if self.cold_start.blocks_dial(campaign.id).await? {
            coordinator.claim_reservation(campaign.id, job.id).await?;
            self.queue
                .park_again(campaign.id, job.id, SHORT_REPARK)
                .await?;
            return Ok(());
        }

        // Data checks: a missing or already-settled contact fails the job
        // permanently (never retried).
        let contact = match self.kernel.store.get_contact(job.contact_id).await? {
            Some(contact) if !contact.status.is_settled() => contact,
            Some(_) | None => {
                coordinator.claim_reservation(campaign.id, job.id).await?;
                coordinator
                    .queue_finish(campaign.id, job.id, crate::coordinator::JobState::Failed)
                    .await?;
                warn!(
                    campaign_id = %campaign.id,
                    job_id = %job.id,
                    contact_id = %job.contact_id,
                    "job skipped: contact missing or settled"
                );
                return Ok(());
            }
        };

        let call_log = CallLog::builder()
            .user_id(campaign.user_id)
            .campaign_id(campaign.id)
            .contact_id(contact.id)
            .agent_id(campaign.agent_id)
            .phone_id(campaign.phone_id)
            .job_id(job.id)
            .build();
        self.kernel.store.insert_call_log(&call_log).await?;

        let Some(scope) = PreDialScope::acquire(
            coordinator.clone(),
            campaign.id,
            call_log.id,
            configured_limit,
        )
        .await?
        else {
            // No slot under the ceiling: give the reservation back and let
            // the queue's retry policy schedule the next attempt.
            coordinator.claim_reservation(campaign.id, job.id).await?;
            self.retry_or_fail(campaign, &job, &contact, call_log.id, CallLogStatus::Failed, true)
                .await?;
            return Ok(());
        };

        // Slot accounting swaps reservation for lease here (earliest point).
        coordinator.claim_reservation(campaign.id, job.id).await?;

        self.kernel
            .store
            .set_contact_status(contact.id, ContactStatus::Calling)
            .await?;
        self.kernel
            .store
            .apply_counter_delta(
                campaign.id,
                CounterDelta {
                    queued: -1,
                    active: 1,
                    ..Default::default()
                },
            )
            .await?;

        self.dial(campaign, &job, &contact, call_log, scope, configured_limit)
            .await
    }

    async fn dial(
        &self,
        campaign: &Campaign,
        job: &QueueJob,
        contact: &CampaignContact,
        call_log: CallLog,
        scope: PreDialScope,
        configured_limit: u32,
    ) -> Result<()> {
        let store = &self.kernel.store;
        let profile = self.kernel.phones.resolve(campaign.phone_id).await?;

        let request = DialRequest {
            to: contact.phone_number.clone(),
            from: profile.from,
            caller_id: profile.caller_id,
            app_id: profile.app_id,
            call_log_id: call_log.id,
            credentials: profile.credentials,
            status_callback: self
                .kernel
                .config
                .webhook_base_url
                .as_ref()
                .map(|base| format!("{base}/webhooks/call-status")),
        };

        let initiated = self.kernel.carrier.initiate(&request).await;
        let result = match initiated {
            Ok(result) => result,
            Err(e) => {
                scope.release(true).await?;
                self.cold_start
                    .note_failure(campaign.id, configured_limit, &e)
                    .await?;
                if e.is_auth_failure() {
                    error!(
                        campaign_id = %campaign.id,
                        phone_id = %campaign.phone_id,
                        error = %e,
                        "carrier rejected phone credentials; disable the phone"
                    );
                }
                self.revert_to_active_accounting(campaign).await?;
                self.retry_or_fail(
                    campaign,
                    job,
                    contact,
                    call_log.id,
                    CallLogStatus::Failed,
                    e.is_retryable(),
                )
                .await?;
                return Ok(());
            }
        };

        store
            .set_call_sid(call_log.id, &result.sid, result.status.into())
            .await?;
        debug!(
            campaign_id = %campaign.id,
            call_log_id = %call_log.id,
            sid = %result.sid,
            status = %result.status,
            "carrier accepted initiate"
        );

        // Brief wait for the carrier to advance to ringing / in-progress.
        let mut status = result.status;
        let mut polls = 0;
        while !status.is_advancing() && !status.is_terminal() && polls < STATUS_POLLS {
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
            polls += 1;
            match self
                .kernel
                .carrier
                .get_details(&request.credentials, &result.sid)
                .await
            {
                Ok(details) => status = details.status,
                Err(e) => {
                    debug!(sid = %result.sid, error = %e, "status poll failed");
                    break;
                }
            }
        }

        if status.is_advancing() {
            match scope.upgrade().await? {
                Some(active_token) => {
                    store
                        .set_call_lease_token(call_log.id, active_token.as_str(), status.into())
                        .await?;
                    self.kernel
                        .coordinator
                        .queue_finish(campaign.id, job.id, crate::coordinator::JobState::Completed)
                        .await?;
                    self.cold_start
                        .note_success(campaign.id, configured_limit)
                        .await?;
                    info!(
                        campaign_id = %campaign.id,
                        call_log_id = %call_log.id,
                        sid = %result.sid,
                        "call live; active lease held until webhook"
                    );
                    return Ok(());
                }
                None => {
                    // Pre-dial expired under us: the slot is gone, the call
                    // may be live. Tear it down and retry.
                    warn!(
                        campaign_id = %campaign.id,
                        call_log_id = %call_log.id,
                        "pre-dial lease lost before upgrade; hanging up"
                    );
                    let _ = self
                        .kernel
                        .carrier
                        .hangup(&request.credentials, &result.sid)
                        .await;
                    self.revert_to_active_accounting(campaign).await?;
                    self.retry_or_fail(
                        campaign,
                        job,
                        contact,
                        call_log.id,
                        CallLogStatus::Failed,
                        true,
                    )
                    .await?;
                    return Ok(());
                }
            }
        }

        // Never advanced (or went straight to a terminal status): release
        // the slot and settle this attempt.
        if !status.is_terminal() {
            let _ = self
                .kernel
                .carrier
                .hangup(&request.credentials, &result.sid)
                .await;
        }
        scope.release(true).await?;
        self.revert_to_active_accounting(campaign).await?;
        self.retry_or_fail(campaign, job, contact, call_log.id, status.into(), true)
            .await?;
        Ok(())
    }

    /// Undo the queued→active counter move made when dialing started.
    /// The retry/fail bookkeeping then moves the contact to its next bucket.
    async fn revert_to_active_accounting(&self, campaign: &Campaign) -> Result<()> {
        self.kernel
            .store
            .apply_counter_delta(
                campaign.id,
                CounterDelta {
                    active: -1,
                    queued: 1,
                    ..Default::default()
                },
            )
            .await
    }

    /// Settle one failed attempt: park for a backoff retry while attempts
    /// remain, otherwise fail the job and the contact. The call log for this
    /// attempt is finalized either way so a late webhook for the same sid is
    /// a no-op.
    async fn retry_or_fail(
        &self,
        campaign: &Campaign,
        job: &QueueJob,
        contact: &CampaignContact,
        call_log_id: crate::common::CallLogId,
        status: CallLogStatus,
        retryable: bool,
    ) -> Result<()> {
        let store = &self.kernel.store;
        let terminal_status = if status.is_terminal() {
            status
        } else {
            CallLogStatus::Failed
        };
        store
            .finalize_call_log(call_log_id, terminal_status, None, None)
            .await?;

        if retryable && job.attempts_made + 1 < job.max_attempts {
            store
                .set_contact_status(contact.id, ContactStatus::Queued)
                .await?;
            self.queue.park_for_retry(campaign.id, job).await?;
            debug!(
                campaign_id = %campaign.id,
                job_id = %job.id,
                attempt = job.attempts_made + 1,
                "attempt failed; parked for backoff retry"
            );
        } else {
            self.kernel
                .coordinator
                .queue_finish(campaign.id, job.id, crate::coordinator::JobState::Failed)
                .await?;
            store
                .finalize_contact(contact.id, ContactStatus::Failed, false)
                .await?;
            store
                .apply_counter_delta(
                    campaign.id,
                    CounterDelta {
                        queued: -1,
                        failed: 1,
                        ..Default::default()
                    },
                )
                .await?;
            info!(
                campaign_id = %campaign.id,
                job_id = %job.id,
                contact_id = %contact.id,
                "attempts exhausted; contact failed"
            );
        }
        Ok(())
    }

    async fn promotion_is_stale(&self, campaign: &Campaign, job: &QueueJob) -> Result<bool> {
        let coordinator = &self.kernel.coordinator;
        let now = coordinator.now_ms();
        let gate = coordinator.promote_gate(campaign.id).await?;
        let stale = match (job.promote_seq, job.promoted_at_ms) {
            (Some(seq), Some(promoted_at)) => {
                seq < 0 || seq < gate - STALE_GATE_LAG || now - promoted_at > STALE_PROMOTION_MS
            }
            _ => true,
        };
        Ok(stale)
    }

    /// One gate repair: give the slot back and re-park. After too many
    /// repairs the job is hard-synced: stamped with the sentinel sequence
    /// and pushed back through the waitlist path.
    async fn repair_gate(&self, campaign: &Campaign, job: QueueJob) -> Result<()> {
        let coordinator = &self.kernel.coordinator;
        coordinator.claim_reservation(campaign.id, job.id).await?;

        let repairs = job.gate_repairs + 1;
        let hard_sync = repairs >= MAX_GATE_REPAIRS;
        let delay = if hard_sync {
            Duration::ZERO
        } else {
            SHORT_REPARK
        };
        self.queue.park_again(campaign.id, job.id, delay).await?;

        if let Some(mut parked) = coordinator.queue_get(campaign.id, job.id).await? {
            parked.gate_repairs = repairs;
            if hard_sync {
                parked.promote_seq = Some(-1);
            }
            coordinator.queue_update(&parked).await?;
        }

        if hard_sync {
            warn!(
                campaign_id = %campaign.id,
                job_id = %job.id,
                repairs,
                "hard-synced job after repeated stale promotions"
            );
        } else {
            debug!(
                campaign_id = %campaign.id,
                job_id = %job.id,
                repairs,
                "refused stale promotion"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Service for CallWorker {
    fn name(&self) -> &'static str {
        "call-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let worked = match self.tick().await {
                Ok(worked) => worked,
                Err(e) => {
                    warn!(error = %e, "worker tick failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };
            if !worked {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }
        Ok(())
    }
}
