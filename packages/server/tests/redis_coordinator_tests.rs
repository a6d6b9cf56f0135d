//! Redis-backed coordinator tests against a real server via testcontainers.
//!
//! These need a local Docker daemon, so they are ignored by default:
//! `cargo test --test redis_coordinator_tests -- --ignored`

use std::time::Duration;

use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;

use dialer_core::common::{CallLogId, CampaignId, ContactId};
use dialer_core::coordinator::{
    Coordinator, JobState, Lane, LeasePhase, QueueJob, RedisCoordinator, ReleaseOutcome,
};

async fn coordinator() -> (testcontainers::ContainerAsync<Redis>, RedisCoordinator) {
    let container = Redis::default()
        .start()
        .await
        .expect("failed to start redis container");
    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(6379).await.unwrap();
    let url = format!("redis://{host}:{port}");
    let coordinator = RedisCoordinator::connect(&url).await.unwrap();
    (container, coordinator)
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn lease_scripts_enforce_the_ceiling() {
    let (_container, coord) = coordinator().await;
    let campaign = CampaignId::new();
    coord.set_limit(campaign, 1).await.unwrap();

    let first = coord
        .acquire_pre_dial(campaign, CallLogId::new(), 1)
        .await
        .unwrap();
    assert!(first.is_some());
    let second = coord
        .acquire_pre_dial(campaign, CallLogId::new(), 1)
        .await
        .unwrap();
    assert!(second.is_some(), "the +1 slack admits one extra");
    let third = coord
        .acquire_pre_dial(campaign, CallLogId::new(), 1)
        .await
        .unwrap();
    assert!(third.is_none());
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn upgrade_swaps_members_and_release_is_idempotent() {
    let (_container, coord) = coordinator().await;
    let campaign = CampaignId::new();
    let call = CallLogId::new();
    coord.set_limit(campaign, 2).await.unwrap();

    let pre = coord
        .acquire_pre_dial(campaign, call, 2)
        .await
        .unwrap()
        .unwrap();
    let active = coord
        .upgrade_to_active(campaign, call, &pre)
        .await
        .unwrap()
        .unwrap();

    let snapshot = coord.slot_snapshot(campaign).await.unwrap();
    assert_eq!(snapshot.inflight, 1);

    let released = coord
        .release_slot(campaign, call, &active, LeasePhase::Active, true)
        .await
        .unwrap();
    assert_eq!(released, ReleaseOutcome::Released);
    let again = coord
        .release_slot(campaign, call, &active, LeasePhase::Active, true)
        .await
        .unwrap();
    assert_eq!(again, ReleaseOutcome::AlreadyReleased);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn pop_reserve_promote_and_queue_round_trip() {
    let (_container, coord) = coordinator().await;
    let campaign = CampaignId::new();
    coord.set_limit(campaign, 2).await.unwrap();

    let job = QueueJob::park(campaign, ContactId::new(), Lane::High, coord.now_ms());
    assert!(coord.queue_add(&job).await.unwrap());
    coord
        .waitlist_push(
            campaign,
            Lane::High,
            job.id,
            job.contact_id,
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let batch = coord.pop_reserve_promote(campaign, 2, 5).await.unwrap();
    assert_eq!(batch.count(), 1);
    assert_eq!(batch.entries[0].lane, Lane::High);
    assert!(batch.seq >= 1);

    assert!(coord
        .queue_promote(campaign, job.id, batch.seq)
        .await
        .unwrap());
    let claimed = coord.queue_claim(campaign).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.promote_seq, Some(batch.seq));

    assert!(coord.claim_reservation(campaign, job.id).await.unwrap());
    let snapshot = coord.slot_snapshot(campaign).await.unwrap();
    assert_eq!(snapshot.reserved, 0);
    assert_eq!(snapshot.ledger_len, 0);

    coord
        .queue_finish(campaign, job.id, JobState::Completed)
        .await
        .unwrap();
    assert_eq!(
        coord.queue_state(campaign, job.id).await.unwrap(),
        Some(JobState::Completed)
    );
}
