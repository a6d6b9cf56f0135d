//! Lease lifecycle scenarios: unanswered pre-dials, duplicate webhooks,
//! and stale promotion gates.

mod common;

use common::Harness;
use test_context::test_context;
use dialer_core::config::ColdStartConfig;
use dialer_core::coordinator::Coordinator;
use dialer_core::domains::campaigns::models::{CallLogStatus, ContactStatus};
use dialer_core::domains::campaigns::webhook::{finalize_call, CallStatusUpdate, FinalizeOutcome};
use dialer_core::domains::campaigns::CampaignStore;
use dialer_core::kernel::MockDialOutcome;

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
#[tokio::test(start_paused = true)]
async fn never_answered_call_retries_then_fails_the_contact(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(1, 1).await;
    harness.api.start(campaign_id, user_id).await.unwrap();
    finish_cold_start(&harness, campaign_id, 1).await;

    // Carrier accepts every call but none ever advances past `queued`.
    harness.carrier.set_default_outcome(MockDialOutcome::StayQueued);

    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 30, "never-answered loop did not settle");
        harness.drain_events().await;
        harness.promote(campaign_id).await;
        harness.drain_events().await;
        harness.work_all().await;
        harness.drain_events().await;
        harness.assert_capacity(campaign_id).await;

        let campaign = harness.store.campaign(campaign_id).unwrap();
        if campaign.failed_calls == 1 {
            break;
        }
    }

    // Three initiations (the attempt budget), each torn down by hangup.
    assert_eq!(harness.carrier.dial_count(), 3);
    assert_eq!(harness.carrier.hangups().len(), 3);
    assert_eq!(harness.carrier.open_calls(), 0);

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
async fn duplicate_webhook_is_absorbed_and_counts_once(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(1, 1).await;
    harness.api.start(campaign_id, user_id).await.unwrap();
    finish_cold_start(&harness, campaign_id, 1).await;

    harness.drain_events().await;
    harness.promote(campaign_id).await;
    harness.drain_events().await;
    harness.work_all().await;

    let dials = harness.carrier.dials();
    assert_eq!(dials.len(), 1);
    let call_log_id = dials[0].call_log_id;

    let update = CallStatusUpdate {
        status: CallLogStatus::Completed,
        duration_secs: Some(42),
        recording_url: Some("https://recordings.exotel.com/x.mp3".to_string()),
    };

    let first = finalize_call(&harness.kernel, call_log_id, update.clone())
        .await
        .unwrap();
    assert_eq!(first, FinalizeOutcome::Applied);

    let second = finalize_call(&harness.kernel, call_log_id, update)
        .await
        .unwrap();
    assert_eq!(second, FinalizeOutcome::Duplicate);

    let campaign = harness.store.campaign(campaign_id).unwrap();
    assert_eq!(campaign.completed_calls, 1);
    assert_eq!(campaign.active_calls, 0);

    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert_eq!(snapshot.inflight, 0);
}

#[test_context(Harness)]
#[tokio::test]
async fn stale_promotion_is_refused_and_repaired(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(1, 1).await;
    harness.api.start(campaign_id, user_id).await.unwrap();
    finish_cold_start(&harness, campaign_id, 1).await;

    harness.drain_events().await;
    harness.promote(campaign_id).await;
    harness.drain_events().await;

    // Backdate the promotion stamp past the freshness window.
    let contact = harness.store.pending_contacts(campaign_id).await.unwrap();
    assert!(contact.is_empty());
    let job_ids = harness
        .coordinator
        .queue_removable(campaign_id)
        .await
        .unwrap();
    assert_eq!(job_ids.len(), 1);
    let mut job = harness
        .coordinator
        .queue_get(campaign_id, job_ids[0])
        .await
        .unwrap()
        .unwrap();
    job.promoted_at_ms = Some(harness.coordinator.now_ms() - 20_000);
    harness.coordinator.queue_update(&job).await.unwrap();

    harness.work_all().await;

    // No dial happened; the reservation was given back and the job is
    // parked again with one recorded repair.
    assert_eq!(harness.carrier.dial_count(), 0);
    let snapshot = harness
        .coordinator
        .slot_snapshot(campaign_id)
        .await
        .unwrap();
    assert_eq!(snapshot.reserved, 0);

    let parked = harness
        .coordinator
        .queue_get(campaign_id, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.gate_repairs, 1);
    assert_eq!(parked.state, dialer_core::coordinator::JobState::Delayed);
}

#[test_context(Harness)]
#[tokio::test]
async fn repeated_gate_repairs_hard_sync_the_job(harness: &Harness) {
    let (campaign_id, user_id) = harness.seed_campaign(1, 1).await;
    harness.api.start(campaign_id, user_id).await.unwrap();
    finish_cold_start(&harness, campaign_id, 1).await;

    harness.drain_events().await;
    harness.promote(campaign_id).await;
    harness.drain_events().await;

    let job_ids = harness
        .coordinator
        .queue_removable(campaign_id)
        .await
        .unwrap();
    let mut job = harness
        .coordinator
        .queue_get(campaign_id, job_ids[0])
        .await
        .unwrap()
        .unwrap();
    job.promoted_at_ms = Some(harness.coordinator.now_ms() - 20_000);
    job.gate_repairs = 4;
    harness.coordinator.queue_update(&job).await.unwrap();

    harness.work_all().await;
    harness.drain_events().await;

    let synced = harness
        .coordinator
        .queue_get(campaign_id, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.gate_repairs, 5);
    assert_eq!(synced.promote_seq, Some(-1));

    // The hard-synced job is back on the normal waitlist and can be
    // promoted and dialed normally.
    harness.promote(campaign_id).await;
    harness.drain_events().await;
    harness.work_all().await;
    assert_eq!(harness.carrier.dial_count(), 1);

    let contact_status = {
        let dial = &harness.carrier.dials()[0];
        let log = harness
            .store
            .get_call_log(dial.call_log_id)
            .await
            .unwrap()
            .unwrap();
        harness.store.contact(log.contact_id).unwrap().status
    };
    assert_eq!(contact_status, ContactStatus::Calling);
}
