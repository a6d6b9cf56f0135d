//! Cold-start ramp driven through the full pipeline.

mod common;

use common::Harness;
use test_context::test_context;
use dialer_core::coordinator::{ColdStartPhase, Coordinator};
use dialer_core::domains::campaigns::models::{CallLogStatus, CampaignStatus};

#[test_context(Harness)]
#[tokio::test]
async fn ramp_reaches_the_configured_limit_after_five_upgrades(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(10, 20).await;
    harness.api.start(campaign_id, user_id).await.unwrap();

    // Warming pins the effective limit to one.
    assert_eq!(
        harness.coordinator.get_limit(campaign_id).await.unwrap(),
        Some(1)
    );
    assert_eq!(
        harness
            .coordinator
            .cold_start_phase(campaign_id)
            .await
            .unwrap(),
        Some(ColdStartPhase::Warming)
    );

    let mut observed_limits = vec![1u32];
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 60, "ramp test did not drain");

        harness.drain_events().await;
        harness.promote(campaign_id).await;
        harness.drain_events().await;
        harness.work_all().await;

        // Concurrency never exceeds the current effective limit + 1.
        let limit = harness
            .coordinator
            .get_limit(campaign_id)
            .await
            .unwrap()
            .unwrap_or(0);
        assert!(
            harness.carrier.open_calls() <= limit as i64 + 1,
            "open calls {} exceeded effective limit {}",
            harness.carrier.open_calls(),
            limit
        );
        if observed_limits.last() != Some(&limit) {
            observed_limits.push(limit);
        }
        harness.assert_capacity(campaign_id).await;

        harness.finalize_open_calls(CallLogStatus::Completed).await;
        harness.drain_events().await;

        let campaign = harness.store.campaign(campaign_id).unwrap();
        if campaign.status == CampaignStatus::Completed {
            break;
        }
    }

    // The effective limit stepped up and finished at the configured value.
    assert_eq!(
        harness
            .coordinator
            .cold_start_phase(campaign_id)
            .await
            .unwrap(),
        Some(ColdStartPhase::Done)
    );
    assert_eq!(
        harness.coordinator.get_limit(campaign_id).await.unwrap(),
        Some(10)
    );
    assert!(observed_limits.windows(2).all(|w| w[0] <= w[1]));
    assert!(observed_limits.contains(&2), "missing the first ramp step");

    let campaign = harness.store.campaign(campaign_id).unwrap();
    assert_eq!(campaign.completed_calls, 20);
}
