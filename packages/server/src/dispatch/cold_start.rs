//! Cold-start ramp control.
//!
//! A freshly activated campaign dials at a reduced effective limit until a
//! few upgrades succeed, protecting the carrier account from a thundering
//! start. Phases are named Warming / Ramping / Done, deliberately distinct
//! from the circuit breaker's Closed / Open / HalfOpen.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::common::CampaignId;
use crate::config::ColdStartConfig;
use crate::coordinator::{ColdStartPhase, Coordinator};
use crate::kernel::CarrierError;

pub struct ColdStartControl {
    coordinator: Arc<dyn Coordinator>,
    config: ColdStartConfig,
}

impl ColdStartControl {
    pub fn new(coordinator: Arc<dyn Coordinator>, config: ColdStartConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Enter warming: pin the effective limit down to the configured initial
    /// value (never above the campaign's own ceiling).
    pub async fn begin(&self, campaign: CampaignId, configured_limit: u32) -> Result<()> {
        let initial = self.config.initial_limit.min(configured_limit).max(1);
        self.coordinator.cold_start_begin(campaign, initial).await?;
        info!(campaign_id = %campaign, initial_limit = initial, "cold start warming");
        Ok(())
    }

    /// Cheap pre-check the worker runs before attempting a lease: while
    /// warming, only one dial may be in flight.
    pub async fn blocks_dial(&self, campaign: CampaignId) -> Result<bool> {
        match self.coordinator.cold_start_phase(campaign).await? {
            Some(ColdStartPhase::Warming) => {
                let snapshot = self.coordinator.slot_snapshot(campaign).await?;
                Ok(snapshot.inflight >= 1)
            }
            _ => Ok(false),
        }
    }

    /// Record a successful upgrade and advance the ramp.
    pub async fn note_success(&self, campaign: CampaignId, configured_limit: u32) -> Result<()> {
        let phase = self
            .coordinator
            .cold_start_note_success(campaign, &self.config, configured_limit)
            .await?;
        if let Some(phase) = phase {
            info!(campaign_id = %campaign, phase = phase.as_str(), "cold start advanced");
        }
        Ok(())
    }

    /// Rewind the ramp one step after a sustained carrier failure.
    pub async fn note_failure(
        &self,
        campaign: CampaignId,
        configured_limit: u32,
        error: &CarrierError,
    ) -> Result<()> {
        if !error.is_sustained_failure() {
            return Ok(());
        }
        self.coordinator
            .cold_start_rewind(campaign, &self.config, configured_limit)
            .await?;
        info!(campaign_id = %campaign, "cold start rewound");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;

    fn control() -> (Arc<dyn Coordinator>, ColdStartControl) {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let control = ColdStartControl::new(coordinator.clone(), ColdStartConfig::default());
        (coordinator, control)
    }

    #[tokio::test]
    async fn ramp_raises_the_limit_in_steps() {
        let (coord, control) = control();
        let campaign = CampaignId::new();
        control.begin(campaign, 10).await.unwrap();
        assert_eq!(coord.get_limit(campaign).await.unwrap(), Some(1));

        control.note_success(campaign, 10).await.unwrap();
        assert_eq!(coord.get_limit(campaign).await.unwrap(), Some(1));

        control.note_success(campaign, 10).await.unwrap();
        assert_eq!(coord.get_limit(campaign).await.unwrap(), Some(2));
        assert_eq!(
            coord.cold_start_phase(campaign).await.unwrap(),
            Some(ColdStartPhase::Ramping)
        );

        control.note_success(campaign, 10).await.unwrap();
        assert_eq!(coord.get_limit(campaign).await.unwrap(), Some(4));

        control.note_success(campaign, 10).await.unwrap();
        assert_eq!(coord.get_limit(campaign).await.unwrap(), Some(8));

        control.note_success(campaign, 10).await.unwrap();
        assert_eq!(coord.get_limit(campaign).await.unwrap(), Some(10));
        assert_eq!(
            coord.cold_start_phase(campaign).await.unwrap(),
            Some(ColdStartPhase::Done)
        );
    }

    #[tokio::test]
    async fn ramp_never_exceeds_the_configured_limit() {
        let (coord, control) = control();
        let campaign = CampaignId::new();
        control.begin(campaign, 3).await.unwrap();
        for _ in 0..6 {
            control.note_success(campaign, 3).await.unwrap();
        }
        assert_eq!(coord.get_limit(campaign).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn sustained_failure_rewinds_one_step() {
        let (coord, control) = control();
        let campaign = CampaignId::new();
        control.begin(campaign, 10).await.unwrap();
        for _ in 0..5 {
            control.note_success(campaign, 10).await.unwrap();
        }
        assert_eq!(
            coord.cold_start_phase(campaign).await.unwrap(),
            Some(ColdStartPhase::Done)
        );

        control
            .note_failure(campaign, 10, &CarrierError::Upstream("503".into()))
            .await
            .unwrap();
        assert_eq!(
            coord.cold_start_phase(campaign).await.unwrap(),
            Some(ColdStartPhase::Ramping)
        );
        assert_eq!(coord.get_limit(campaign).await.unwrap(), Some(5));

        // Data errors do not rewind.
        control
            .note_failure(campaign, 10, &CarrierError::Rejected("400".into()))
            .await
            .unwrap();
        assert_eq!(
            coord.cold_start_phase(campaign).await.unwrap(),
            Some(ColdStartPhase::Ramping)
        );
    }

    #[tokio::test]
    async fn warming_blocks_second_dial() {
        let (coord, control) = control();
        let campaign = CampaignId::new();
        control.begin(campaign, 10).await.unwrap();
        assert!(!control.blocks_dial(campaign).await.unwrap());

        coord
            .acquire_pre_dial(campaign, crate::common::CallLogId::new(), 1)
            .await
            .unwrap();
        assert!(control.blocks_dial(campaign).await.unwrap());
    }
}
