//! Pause and resume semantics: in-flight calls finish, admission stops,
//! resume picks the campaign back up.

mod common;

use common::Harness;
use test_context::test_context;
use dialer_core::config::ColdStartConfig;
use dialer_core::coordinator::Coordinator;
use dialer_core::domains::campaigns::models::{CallLogStatus, CampaignStatus};
use dialer_core::domains::campaigns::CampaignStore;

async fn finish_cold_start(harness: &Harness, campaign: dialer_core::common::CampaignId, limit: u32) {
    let cold = ColdStartConfig::default();
    for _ in 0..cold.done_after_successes {
        harness
            .coordinator
            .cold_start_note_success(campaign, &cold, limit)
            .await
            .unwrap();
    }
}

#[test_context(Harness)]
#[tokio::test]
async fn pause_blocks_promotion_and_lets_live_calls_finish(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(5, 10).await;
    harness.api.start(campaign_id, user_id).await.unwrap();
    finish_cold_start(&harness, campaign_id, 5).await;

    // Get a batch of live calls going.
    harness.drain_events().await;
    harness.promote(campaign_id).await;
    harness.drain_events().await;
    harness.work_all().await;
    let live_before_pause = harness.carrier.open_calls();
    assert!(live_before_pause > 0);

    harness.api.pause(campaign_id, user_id).await.unwrap();
    assert_eq!(
        harness.store.campaign(campaign_id).unwrap().status,
        CampaignStatus::Paused
    );

    // No promotions happen while paused.
    harness.promote(campaign_id).await;
    harness.drain_events().await;
    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert_eq!(snapshot.reserved, 0);

    // No new dials either.
    let dials_at_pause = harness.carrier.dial_count();
    harness.work_all().await;
    assert_eq!(harness.carrier.dial_count(), dials_at_pause);

    // In-flight calls complete normally and drain the slot accounting.
    harness.finalize_open_calls(CallLogStatus::Completed).await;
    harness.drain_events().await;
    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert_eq!(snapshot.inflight, 0);
    assert_eq!(snapshot.reserved, 0);
    assert_eq!(harness.carrier.open_calls(), 0);

    // Resume re-admits the rest of the campaign.
    harness.api.resume(campaign_id, user_id).await.unwrap();
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 60, "resume did not drain the campaign");
        harness.drain_events().await;
        harness.promote(campaign_id).await;
        harness.drain_events().await;
        harness.work_all().await;
        harness.assert_capacity(campaign_id).await;
        harness.finalize_open_calls(CallLogStatus::Completed).await;
        harness.drain_events().await;

        let campaign = harness.store.campaign(campaign_id).unwrap();
        if campaign.status == CampaignStatus::Completed {
            break;
        }
    }

    let campaign = harness.store.campaign(campaign_id).unwrap();
    assert_eq!(campaign.completed_calls, 10);
}

#[test_context(Harness)]
#[tokio::test]
async fn cancel_removes_queued_work_and_skips_contacts(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(2, 8).await;
    harness.api.start(campaign_id, user_id).await.unwrap();
    harness.drain_events().await;

    let report = harness.api.cancel(campaign_id, user_id).await.unwrap();
    assert_eq!(report.jobs_removed, 8);
    assert_eq!(report.contacts_skipped, 8);
    assert_eq!(
        harness.store.campaign(campaign_id).unwrap().status,
        CampaignStatus::Cancelled
    );

    // Nothing is admissible afterwards.
    harness.drain_events().await;
    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert_eq!(snapshot.inflight, 0);
    assert_eq!(snapshot.reserved, 0);
}

#[test_context(Harness)]
#[tokio::test]
async fn voicemail_outcome_counts_separately_and_blocks_retry(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(1, 1).await;
    harness.api.start(campaign_id, user_id).await.unwrap();
    finish_cold_start(&harness, campaign_id, 1).await;

    harness.drain_events().await;
    harness.promote(campaign_id).await;
    harness.drain_events().await;
    harness.work_all().await;

    let dial = &harness.carrier.dials()[0];
    let outcome = dialer_core::domains::campaigns::webhook::finalize_call(
        &harness.kernel,
        dial.call_log_id,
        dialer_core::domains::campaigns::webhook::CallStatusUpdate {
            status: CallLogStatus::Voicemail,
            duration_secs: Some(12),
            recording_url: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(
        outcome,
        dialer_core::domains::campaigns::webhook::FinalizeOutcome::Applied
    );
    harness.carrier.end_call(&dial.sid);

    let campaign = harness.store.campaign(campaign_id).unwrap();
    assert_eq!(campaign.voicemail_calls, 1);
    assert_eq!(campaign.completed_calls, 0);

    // Voicemail-marked contact is refused by manual retry under the
    // default exclude_voicemail setting... but the contact completed, so
    // there is nothing to retry at all.
    let log = harness
        .store
        .get_call_log(dial.call_log_id)
        .await
        .unwrap()
        .unwrap();
    let contact = harness.store.contact(log.contact_id).unwrap();
    assert!(contact.voicemail);
}
