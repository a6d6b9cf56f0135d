//! Deterministic test harness for the dispatch pipeline.
//!
//! Builds the full engine on the in-memory coordinator, the in-memory
//! store, and the scripted carrier, then drives each stage explicitly:
//! queue events are drained by hand, the promoter and worker run one tick
//! at a time, and webhook finalisation is invoked directly. Tests using a
//! paused tokio runtime can advance TTLs precisely.
//!
//! # Example using test-context
//!
//! ```ignore
//! use test_context::test_context;
//!
//! #[test_context(Harness)]
//! #[tokio::test]
//! async fn my_test(harness: &Harness) {
//!     let (campaign_id, user_id) = harness.seed_campaign(2, 5).await;
//!     // ... test code
//! }
//! ```

use std::sync::Arc;

use test_context::AsyncTestContext;

use tokio::sync::broadcast::Receiver;
use tokio::sync::Mutex;

use dialer_core::common::{AgentId, CampaignId, PhoneId, UserId};
use dialer_core::coordinator::{Coordinator, MemoryCoordinator, QueueEvent};
use dialer_core::dispatch::{
    CallWorker, LeaseJanitor, Promoter, WaitlistSyncer,
};
use dialer_core::domains::campaigns::models::{
    CallLogStatus, Campaign, CampaignSettings, NewContact,
};
use dialer_core::domains::campaigns::webhook::{finalize_call, CallStatusUpdate, FinalizeOutcome};
use dialer_core::domains::campaigns::{CampaignApi, CampaignStore};
use dialer_core::kernel::{
    CarrierCredentials, DialerKernel, DispatchConfig, MemoryCampaignStore, MockCarrier,
    PhoneProfile, StaticPhoneDirectory,
};

pub struct Harness {
    pub kernel: Arc<DialerKernel>,
    pub coordinator: Arc<MemoryCoordinator>,
    pub store: Arc<MemoryCampaignStore>,
    pub carrier: Arc<MockCarrier>,
    pub api: CampaignApi,
    pub promoter: Promoter,
    pub worker: CallWorker,
    pub janitor: LeaseJanitor,
    syncer: WaitlistSyncer,
    events: Mutex<Receiver<QueueEvent>>,
    finalized: Mutex<Vec<String>>,
}

impl AsyncTestContext for Harness {
    async fn setup() -> Self {
        Harness::new()
    }

    async fn teardown(self) {
        // Everything is in-process; nothing to close.
    }
}

impl Harness {
    pub fn new() -> Self {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let store = Arc::new(MemoryCampaignStore::new());
        let carrier = Arc::new(MockCarrier::new());
        let events = coordinator.subscribe_queue_events();

        let phones = StaticPhoneDirectory::new(PhoneProfile {
            from: "08030752400".to_string(),
            caller_id: "08030752400".to_string(),
            app_id: "12345".to_string(),
            credentials: CarrierCredentials {
                account_sid: "troika1".to_string(),
                api_key: "key".to_string(),
                api_token: "token".to_string(),
                subdomain: "api.exotel.com".to_string(),
            },
        });

        let kernel = Arc::new(DialerKernel::new(
            store.clone(),
            coordinator.clone(),
            carrier.clone(),
            Arc::new(phones),
            DispatchConfig::default(),
        ));

        Self {
            api: CampaignApi::new(kernel.clone()),
            promoter: Promoter::new(kernel.clone()),
            worker: CallWorker::new(kernel.clone()),
            janitor: LeaseJanitor::new(kernel.clone()),
            syncer: WaitlistSyncer::new(kernel.clone()),
            kernel,
            coordinator,
            store,
            carrier,
            events: Mutex::new(events),
            finalized: Mutex::new(Vec::new()),
        }
    }

    /// Create a campaign with `contacts` pending contacts and the given
    /// concurrency limit. Returns (campaign id, owner id).
    pub async fn seed_campaign(&self, limit: u32, contacts: usize) -> (CampaignId, UserId) {
        let user_id = UserId::new();
        let settings = CampaignSettings {
            concurrent_calls_limit: limit,
            retry_failed_calls: false,
            ..Default::default()
        };
        let campaign = Campaign::builder()
            .user_id(user_id)
            .agent_id(AgentId::new())
            .phone_id(PhoneId::new())
            .name("load test")
            .settings(sqlx::types::Json(settings))
            .build();
        let campaign_id = campaign.id;
        self.store.insert_campaign(&campaign).await.unwrap();

        let new_contacts: Vec<NewContact> = (0..contacts)
            .map(|i| {
                NewContact::builder()
                    .phone_number(format!("+9198{:08}", i))
                    .build()
            })
            .collect();
        self.store
            .insert_contacts(campaign_id, &new_contacts)
            .await
            .unwrap();

        (campaign_id, user_id)
    }

    /// Apply every queued lifecycle event through the waitlist syncer.
    pub async fn drain_events(&self) {
        use tokio::sync::broadcast::error::TryRecvError;
        let mut events = self.events.lock().await;
        loop {
            match events.try_recv() {
                Ok(event) => self.syncer.apply(event).await.unwrap(),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    /// One promoter pass for a campaign.
    pub async fn promote(&self, campaign_id: CampaignId) {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .await
            .unwrap()
            .expect("campaign exists");
        self.promoter.promote_campaign(&campaign).await.unwrap();
    }

    /// Run worker ticks until no more jobs are claimable.
    pub async fn work_all(&self) {
        while self.worker.tick().await.unwrap() {}
    }

    /// Finalize every not-yet-finalized live call through the webhook path
    /// with the given terminal status. Returns how many were finalized.
    pub async fn finalize_open_calls(&self, status: CallLogStatus) -> usize {
        let dials = self.carrier.dials();
        let mut done = 0;
        let mut finalized = self.finalized.lock().await;
        for dial in dials {
            if finalized.contains(&dial.sid) {
                continue;
            }
            let log = self
                .store
                .get_call_log(dial.call_log_id)
                .await
                .unwrap()
                .expect("call log exists");
            if log.lease_token.is_none() {
                // Worker settled this attempt itself.
                finalized.push(dial.sid.clone());
                continue;
            }
            let outcome = finalize_call(
                &self.kernel,
                dial.call_log_id,
                CallStatusUpdate {
                    status,
                    duration_secs: Some(30),
                    recording_url: None,
                },
            )
            .await
            .unwrap();
            assert_eq!(outcome, FinalizeOutcome::Applied);
            self.carrier.end_call(&dial.sid);
            finalized.push(dial.sid.clone());
            done += 1;
        }
        done
    }

    /// Assert the capacity invariant for a campaign right now.
    pub async fn assert_capacity(&self, campaign_id: CampaignId) {
        let snapshot = self.coordinator.slot_snapshot(campaign_id).await.unwrap();
        assert!(
            !snapshot.capacity_exceeded(),
            "capacity invariant violated: inflight={} reserved={} limit={}",
            snapshot.inflight,
            snapshot.reserved,
            snapshot.limit
        );
        assert_eq!(
            snapshot.reserved, snapshot.ledger_len as i64,
            "ledger consistency violated"
        );
    }
}
