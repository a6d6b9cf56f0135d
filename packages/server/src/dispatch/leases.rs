//! Scoped pre-dial lease handling.
//!
//! The worker's "start heartbeat, dial, then upgrade" sequence has many exit
//! paths; this scope wrapper centralises release so no path can leak a slot.
//! Dropping an armed scope spawns a best-effort release; the TTL + janitor
//! remain the backstop for process death.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{CallLogId, CampaignId};
use crate::coordinator::{Coordinator, LeasePhase, LeaseToken, ReleaseOutcome};

/// Heartbeat cadence while holding a pre-dial lease.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A held pre-dial lease with a running renewal heartbeat.
pub struct PreDialScope {
    coordinator: Arc<dyn Coordinator>,
    campaign: CampaignId,
    call_id: CallLogId,
    token: LeaseToken,
    heartbeat: CancellationToken,
    armed: bool,
}

impl PreDialScope {
    /// Try to acquire a pre-dial lease; on success the renewal heartbeat is
    /// already running.
    pub async fn acquire(
        coordinator: Arc<dyn Coordinator>,
        campaign: CampaignId,
        call_id: CallLogId,
        fallback_limit: u32,
    ) -> Result<Option<Self>> {
        let Some(token) = coordinator
            .acquire_pre_dial(campaign, call_id, fallback_limit)
            .await?
        else {
            return Ok(None);
        };

        let heartbeat = CancellationToken::new();
        {
            let coordinator = coordinator.clone();
            let token = token.clone();
            let stop = heartbeat.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
                interval.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            match coordinator.renew_pre_dial(campaign, call_id, &token).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    debug!(campaign_id = %campaign, call_id = %call_id,
                                        "pre-dial renewal refused (expired or capped)");
                                    break;
                                }
                                Err(e) => {
                                    warn!(campaign_id = %campaign, call_id = %call_id, error = %e,
                                        "pre-dial heartbeat failed");
                                }
                            }
                        }
                    }
                }
            });
        }

        Ok(Some(Self {
            coordinator,
            campaign,
            call_id,
            token,
            heartbeat,
            armed: true,
        }))
    }

    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    /// Swap the pre-dial member for an active one. On success the scope is
    /// disarmed and the active token returned; on mismatch (expired lease)
    /// the scope is also disarmed — there is nothing left to release.
    pub async fn upgrade(mut self) -> Result<Option<LeaseToken>> {
        self.heartbeat.cancel();
        self.armed = false;
        self.coordinator
            .upgrade_to_active(self.campaign, self.call_id, &self.token)
            .await
    }

    /// Release the pre-dial slot, optionally publishing slot-available.
    pub async fn release(mut self, publish: bool) -> Result<ReleaseOutcome> {
        self.heartbeat.cancel();
        self.armed = false;
        self.coordinator
            .release_slot(
                self.campaign,
                self.call_id,
                &self.token,
                LeasePhase::PreDial,
                publish,
            )
            .await
    }
}

impl Drop for PreDialScope {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        if self.armed {
            let coordinator = self.coordinator.clone();
            let campaign = self.campaign;
            let call_id = self.call_id;
            let token = self.token.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator
                    .release_slot(campaign, call_id, &token, LeasePhase::PreDial, true)
                    .await
                {
                    warn!(campaign_id = %campaign, call_id = %call_id, error = %e,
                        "dropped pre-dial scope failed to release; janitor will recover");
                }
            });
        }
    }
}

/// Release an active lease by stored token, as the webhook handler does.
/// Missing keys and token mismatches are tolerated; double releases from
/// retries plus webhooks must not error.
pub async fn release_active(
    coordinator: &Arc<dyn Coordinator>,
    campaign: CampaignId,
    call_id: CallLogId,
    token: &LeaseToken,
) -> Result<ReleaseOutcome> {
    let outcome = coordinator
        .release_slot(campaign, call_id, token, LeasePhase::Active, true)
        .await?;
    if outcome == ReleaseOutcome::TokenMismatch {
        warn!(campaign_id = %campaign, call_id = %call_id,
            "active release token mismatch; treating as no-op");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;

    fn coordinator() -> Arc<dyn Coordinator> {
        Arc::new(MemoryCoordinator::new())
    }

    #[tokio::test]
    async fn scope_releases_on_explicit_release() {
        let coord = coordinator();
        let campaign = CampaignId::new();
        coord.set_limit(campaign, 1).await.unwrap();

        let scope = PreDialScope::acquire(coord.clone(), campaign, CallLogId::new(), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coord.slot_snapshot(campaign).await.unwrap().inflight, 1);

        scope.release(false).await.unwrap();
        assert_eq!(coord.slot_snapshot(campaign).await.unwrap().inflight, 0);
    }

    #[tokio::test]
    async fn dropping_an_armed_scope_releases_in_background() {
        let coord = coordinator();
        let campaign = CampaignId::new();
        coord.set_limit(campaign, 1).await.unwrap();

        {
            let _scope = PreDialScope::acquire(coord.clone(), campaign, CallLogId::new(), 1)
                .await
                .unwrap()
                .unwrap();
        }
        // Let the spawned release run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coord.slot_snapshot(campaign).await.unwrap().inflight, 0);
    }

    #[tokio::test]
    async fn upgrade_disarms_the_scope() {
        let coord = coordinator();
        let campaign = CampaignId::new();
        let call = CallLogId::new();
        coord.set_limit(campaign, 1).await.unwrap();

        let scope = PreDialScope::acquire(coord.clone(), campaign, call, 1)
            .await
            .unwrap()
            .unwrap();
        let active = scope.upgrade().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        // Still one member: the active lease.
        assert_eq!(coord.slot_snapshot(campaign).await.unwrap().inflight, 1);

        release_active(&coord, campaign, call, &active).await.unwrap();
        assert_eq!(coord.slot_snapshot(campaign).await.unwrap().inflight, 0);
    }
}
