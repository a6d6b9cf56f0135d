//! Crash-recovery scenarios: reservations stranded by a dead promoter and
//! lease members stranded by a dead worker.

mod common;

use std::time::Duration;

use common::Harness;
use test_context::test_context;
use dialer_core::coordinator::{Coordinator, Lane};
use dialer_core::domains::campaigns::CampaignStore;

#[test_context(Harness)]
#[tokio::test(start_paused = true)]
async fn janitor_requeues_reservations_from_a_crashed_promoter(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(3, 10).await;
    harness.api.start(campaign_id, user_id).await.unwrap();
    harness.drain_events().await;
    assert_eq!(
        harness
            .coordinator
            .waitlist_len(campaign_id, Lane::Normal)
            .await
            .unwrap(),
        10
    );

    // The promoter pops three ids, bumps reserved, writes the ledger, and
    // dies before promoting any job.
    let batch = harness
        .coordinator
        .pop_reserve_promote(campaign_id, 3, 3)
        .await
        .unwrap();
    assert_eq!(batch.count(), 3);

    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert_eq!(snapshot.reserved, 3);
    assert_eq!(snapshot.ledger_len, 3);
    assert_eq!(
        harness
            .coordinator
            .waitlist_len(campaign_id, Lane::Normal)
            .await
            .unwrap(),
        7
    );

    // Too early: nothing recovered.
    harness.janitor.sweep().await.unwrap();
    assert_eq!(
        harness
            .coordinator
            .slot_snapshot(campaign_id)
            .await
            .unwrap()
            .reserved,
        3
    );

    // Past the orphan age the ledger entries return to their lane.
    tokio::time::advance(Duration::from_secs(301)).await;
    harness.janitor.sweep().await.unwrap();

    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert_eq!(snapshot.reserved, 0);
    assert_eq!(snapshot.ledger_len, 0);
    assert_eq!(
        harness
            .coordinator
            .waitlist_len(campaign_id, Lane::Normal)
            .await
            .unwrap(),
        10
    );

    // A fresh promoter pass admits under the ceiling again.
    harness.promote(campaign_id).await;
    harness.assert_capacity(campaign_id).await;
    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert!(snapshot.reserved > 0);
}

#[test_context(Harness)]
#[tokio::test(start_paused = true)]
async fn janitor_cleans_members_left_by_a_dead_worker(harness: &Harness) {
    let (campaign_id, _) = harness.seed_campaign(2, 0).await;
    harness
        .coordinator
        .set_limit(campaign_id, 2)
        .await
        .unwrap();

    // Worker acquired a pre-dial lease and crashed without releasing.
    harness
        .coordinator
        .acquire_pre_dial(campaign_id, dialer_core::common::CallLogId::new(), 2)
        .await
        .unwrap()
        .unwrap();

    // The janitor only visits active campaigns; seed_campaign(_, 0) has no
    // contacts so the campaign is activated directly.
    let mut campaign = harness.store.campaign(campaign_id).unwrap();
    campaign.status = dialer_core::domains::campaigns::models::CampaignStatus::Active;
    harness.store.insert_campaign(&campaign).await.unwrap();

    // Lease TTL expires; the member is now an orphan.
    tokio::time::advance(Duration::from_secs(21)).await;
    assert_eq!(
        harness
            .coordinator
            .orphan_member_count(campaign_id)
            .await
            .unwrap(),
        1
    );

    harness.janitor.sweep().await.unwrap();
    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert_eq!(snapshot.inflight, 0);
}
