//! Deterministic implementations of the kernel seams for tests and local
//! development: a scriptable carrier and an in-memory campaign store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exotel::CallStatus;

use crate::common::{CallLogId, CampaignId, ContactId};
use crate::domains::campaigns::models::{
    CallLog, CallLogStatus, Campaign, CampaignContact, CampaignStatus, ContactStatus,
    CounterDelta, NewContact,
};
use crate::domains::campaigns::store::CampaignStore;

use super::carrier::{Carrier, CarrierCredentials, CarrierError, DialRequest, DialResult};

// ============================================================================
// Mock carrier
// ============================================================================

/// Scripted outcome for the next `initiate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockDialOutcome {
    /// Carrier answers immediately (`in-progress`).
    Answer,
    /// Carrier reports ringing.
    Ring,
    /// Carrier accepts but the call never advances past `queued`.
    StayQueued,
    /// Carrier rejects with a 5xx.
    Upstream,
    /// Carrier rejects the credentials.
    AuthFailure,
    /// Carrier rejects the destination (data error).
    BadNumber,
    /// Request times out.
    Timeout,
}

#[derive(Debug, Clone)]
pub struct RecordedDial {
    pub sid: String,
    pub to: String,
    pub call_log_id: CallLogId,
}

struct MockCarrierState {
    script: VecDeque<MockDialOutcome>,
    default_outcome: MockDialOutcome,
    dials: Vec<RecordedDial>,
    statuses: HashMap<String, CallStatus>,
    hangups: Vec<String>,
    next_sid: u64,
    open_calls: i64,
    max_open_calls: i64,
}

/// Carrier double that records every initiation and tracks how many calls
/// are open at once (for capacity assertions). Tests end calls explicitly
/// with [`MockCarrier::end_call`], standing in for the webhook.
pub struct MockCarrier {
    state: Mutex<MockCarrierState>,
}

impl Default for MockCarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockCarrierState {
                script: VecDeque::new(),
                default_outcome: MockDialOutcome::Answer,
                dials: Vec::new(),
                statuses: HashMap::new(),
                hangups: Vec::new(),
                next_sid: 0,
                open_calls: 0,
                max_open_calls: 0,
            }),
        }
    }

    /// Queue an outcome for the next initiate; falls back to the default
    /// outcome when the script runs dry.
    pub fn push_outcome(&self, outcome: MockDialOutcome) {
        self.state.lock().unwrap().script.push_back(outcome);
    }

    pub fn set_default_outcome(&self, outcome: MockDialOutcome) {
        self.state.lock().unwrap().default_outcome = outcome;
    }

    pub fn dials(&self) -> Vec<RecordedDial> {
        self.state.lock().unwrap().dials.clone()
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().unwrap().dials.len()
    }

    pub fn hangups(&self) -> Vec<String> {
        self.state.lock().unwrap().hangups.clone()
    }

    pub fn open_calls(&self) -> i64 {
        self.state.lock().unwrap().open_calls
    }

    /// Highest number of simultaneously open calls observed.
    pub fn max_open_calls(&self) -> i64 {
        self.state.lock().unwrap().max_open_calls
    }

    /// Mark a call ended (the webhook's job in production).
    pub fn end_call(&self, sid: &str) {
        let mut state = self.state.lock().unwrap();
        if state.statuses.remove(sid).is_some() {
            state.open_calls -= 1;
        }
    }
}

#[async_trait]
impl Carrier for MockCarrier {
    async fn initiate(&self, request: &DialRequest) -> Result<DialResult, CarrierError> {
        let mut state = self.state.lock().unwrap();
        let outcome = state
            .script
            .pop_front()
            .unwrap_or(state.default_outcome);

        match outcome {
            MockDialOutcome::Upstream => {
                return Err(CarrierError::Upstream("mock 503".into()));
            }
            MockDialOutcome::AuthFailure => {
                return Err(CarrierError::AuthRejected("mock 401".into()));
            }
            MockDialOutcome::BadNumber => {
                return Err(CarrierError::Rejected("mock 400: invalid number".into()));
            }
            MockDialOutcome::Timeout => {
                return Err(CarrierError::Timeout);
            }
            MockDialOutcome::Answer | MockDialOutcome::Ring | MockDialOutcome::StayQueued => {}
        }

        state.next_sid += 1;
        let sid = format!("mock-sid-{}", state.next_sid);
        let status = match outcome {
            MockDialOutcome::Answer => CallStatus::InProgress,
            MockDialOutcome::Ring => CallStatus::Ringing,
            _ => CallStatus::Queued,
        };
        state.statuses.insert(sid.clone(), status);
        state.dials.push(RecordedDial {
            sid: sid.clone(),
            to: request.to.clone(),
            call_log_id: request.call_log_id,
        });
        state.open_calls += 1;
        state.max_open_calls = state.max_open_calls.max(state.open_calls);

        Ok(DialResult { sid, status })
    }

    async fn hangup(
        &self,
        _credentials: &CarrierCredentials,
        sid: &str,
    ) -> Result<(), CarrierError> {
        let mut state = self.state.lock().unwrap();
        state.hangups.push(sid.to_string());
        if state.statuses.remove(sid).is_some() {
            state.open_calls -= 1;
        }
        Ok(())
    }

    async fn get_details(
        &self,
        _credentials: &CarrierCredentials,
        sid: &str,
    ) -> Result<DialResult, CarrierError> {
        let state = self.state.lock().unwrap();
        match state.statuses.get(sid) {
            Some(status) => Ok(DialResult {
                sid: sid.to_string(),
                status: *status,
            }),
            None => Err(CarrierError::Rejected(format!("unknown sid {sid}"))),
        }
    }
}

// ============================================================================
// In-memory campaign store
// ============================================================================

#[derive(Default)]
struct MemoryStoreState {
    campaigns: HashMap<CampaignId, Campaign>,
    contacts: HashMap<ContactId, CampaignContact>,
    call_logs: HashMap<CallLogId, CallLog>,
    /// Insertion order, the in-memory stand-in for distinct created_at
    /// timestamps.
    contact_seq: HashMap<ContactId, u64>,
    next_contact_seq: u64,
}

/// In-memory [`CampaignStore`] mirroring the Postgres semantics.
#[derive(Default)]
pub struct MemoryCampaignStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct contact read for test assertions.
    pub fn contact(&self, id: ContactId) -> Option<CampaignContact> {
        self.state.lock().unwrap().contacts.get(&id).cloned()
    }

    /// Direct campaign read for test assertions.
    pub fn campaign(&self, id: CampaignId) -> Option<Campaign> {
        self.state.lock().unwrap().campaigns.get(&id).cloned()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .campaigns
            .insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state.lock().unwrap().campaigns.get(&id).cloned())
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&campaign.status) {
            return Ok(false);
        }
        campaign.status = to;
        let now = Utc::now();
        match to {
            CampaignStatus::Active => campaign.started_at = Some(now),
            CampaignStatus::Paused => campaign.paused_at = Some(now),
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed => {
                campaign.completed_at = Some(now)
            }
            _ => {}
        }
        campaign.updated_at = now;
        Ok(true)
    }

    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>> {
        let state = self.state.lock().unwrap();
        let mut active: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|c| c.created_at);
        Ok(active)
    }

    async fn apply_counter_delta(&self, id: CampaignId, delta: CounterDelta) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(campaign) = state.campaigns.get_mut(&id) {
            campaign.queued_calls = (campaign.queued_calls + delta.queued).max(0);
            campaign.active_calls = (campaign.active_calls + delta.active).max(0);
            campaign.completed_calls = (campaign.completed_calls + delta.completed).max(0);
            campaign.failed_calls = (campaign.failed_calls + delta.failed).max(0);
            campaign.voicemail_calls = (campaign.voicemail_calls + delta.voicemail).max(0);
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_contacts(
        &self,
        campaign: CampaignId,
        contacts: &[NewContact],
    ) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let mut inserted = 0u32;
        for new_contact in contacts {
            let duplicate = state.contacts.values().any(|c| {
                c.campaign_id == campaign && c.phone_number == new_contact.phone_number
            });
            if duplicate {
                continue;
            }
            let contact = CampaignContact::builder()
                .campaign_id(campaign)
                .phone_number(new_contact.phone_number.clone())
                .priority(new_contact.priority)
                .build();
            let seq = state.next_contact_seq;
            state.next_contact_seq += 1;
            state.contact_seq.insert(contact.id, seq);
            state.contacts.insert(contact.id, contact);
            inserted += 1;
        }
        if inserted > 0 {
            if let Some(c) = state.campaigns.get_mut(&campaign) {
                c.total_contacts += inserted as i32;
            }
        }
        Ok(inserted)
    }

    async fn get_contact(&self, id: ContactId) -> Result<Option<CampaignContact>> {
        Ok(self.state.lock().unwrap().contacts.get(&id).cloned())
    }

    async fn pending_contacts(&self, campaign: CampaignId) -> Result<Vec<CampaignContact>> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<CampaignContact> = state
            .contacts
            .values()
            .filter(|c| c.campaign_id == campaign && c.status == ContactStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(state.contact_seq.get(&a.id).cmp(&state.contact_seq.get(&b.id)))
        });
        Ok(pending)
    }

    async fn set_contact_status(&self, id: ContactId, status: ContactStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(contact) = state.contacts.get_mut(&id) {
            contact.status = status;
            contact.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finalize_contact(
        &self,
        id: ContactId,
        status: ContactStatus,
        voicemail: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(contact) = state.contacts.get_mut(&id) {
            contact.status = status;
            contact.voicemail = contact.voicemail || voicemail;
            contact.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn schedule_contact_retry(
        &self,
        id: ContactId,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(contact) = state.contacts.get_mut(&id) {
            contact.next_retry_at = Some(next_retry_at);
            contact.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn begin_contact_retry(&self, id: ContactId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(contact) = state.contacts.get_mut(&id) else {
            return Ok(false);
        };
        if contact.status != ContactStatus::Failed {
            return Ok(false);
        }
        contact.retry_count += 1;
        contact.status = ContactStatus::Queued;
        contact.next_retry_at = None;
        contact.updated_at = Utc::now();
        Ok(true)
    }

    async fn contacts_due_for_retry(
        &self,
        campaign: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignContact>> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<CampaignContact> = state
            .contacts
            .values()
            .filter(|c| {
                c.campaign_id == campaign
                    && c.status == ContactStatus::Failed
                    && c.next_retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| c.next_retry_at);
        Ok(due)
    }

    async fn failed_contacts(&self, campaign: CampaignId) -> Result<Vec<CampaignContact>> {
        let state = self.state.lock().unwrap();
        let mut failed: Vec<CampaignContact> = state
            .contacts
            .values()
            .filter(|c| c.campaign_id == campaign && c.status == ContactStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(state.contact_seq.get(&a.id).cmp(&state.contact_seq.get(&b.id)))
        });
        Ok(failed)
    }

    async fn skip_unsettled_contacts(&self, campaign: CampaignId) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut skipped = 0u64;
        for contact in state.contacts.values_mut() {
            if contact.campaign_id == campaign
                && matches!(
                    contact.status,
                    ContactStatus::Pending | ContactStatus::Queued
                )
            {
                contact.status = ContactStatus::Skipped;
                contact.updated_at = Utc::now();
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    async fn insert_call_log(&self, log: &CallLog) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .call_logs
            .insert(log.id, log.clone());
        Ok(())
    }

    async fn get_call_log(&self, id: CallLogId) -> Result<Option<CallLog>> {
        Ok(self.state.lock().unwrap().call_logs.get(&id).cloned())
    }

    async fn find_call_log_by_sid(&self, sid: &str) -> Result<Option<CallLog>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .call_logs
            .values()
            .find(|log| log.exotel_call_sid.as_deref() == Some(sid))
            .cloned())
    }

    async fn set_call_sid(&self, id: CallLogId, sid: &str, status: CallLogStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(log) = state.call_logs.get_mut(&id) {
            log.exotel_call_sid = Some(sid.to_string());
            log.status = status;
            log.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_call_lease_token(
        &self,
        id: CallLogId,
        token: &str,
        status: CallLogStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(log) = state.call_logs.get_mut(&id) {
            log.lease_token = Some(token.to_string());
            log.status = status;
            log.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_call_status(&self, id: CallLogId, status: CallLogStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(log) = state.call_logs.get_mut(&id) {
            log.status = status;
            log.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finalize_call_log(
        &self,
        id: CallLogId,
        status: CallLogStatus,
        duration_secs: Option<i32>,
        recording_url: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(log) = state.call_logs.get_mut(&id) else {
            return Ok(false);
        };
        if log.finalized_at.is_some() {
            return Ok(false);
        }
        log.status = status;
        if duration_secs.is_some() {
            log.duration_secs = duration_secs;
        }
        if let Some(url) = recording_url {
            log.recording_url = Some(url.to_string());
        }
        log.finalized_at = Some(Utc::now());
        log.updated_at = Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_carrier_tracks_open_calls() {
        let carrier = MockCarrier::new();
        let request = DialRequest {
            to: "+919999999999".into(),
            from: "080307".into(),
            caller_id: "080307".into(),
            app_id: "applet".into(),
            call_log_id: CallLogId::new(),
            credentials: CarrierCredentials {
                account_sid: "sid".into(),
                api_key: "k".into(),
                api_token: "t".into(),
                subdomain: "api.exotel.com".into(),
            },
            status_callback: None,
        };

        let a = carrier.initiate(&request).await.unwrap();
        let _b = carrier.initiate(&request).await.unwrap();
        assert_eq!(carrier.open_calls(), 2);
        assert_eq!(carrier.max_open_calls(), 2);

        carrier.end_call(&a.sid);
        assert_eq!(carrier.open_calls(), 1);
        assert_eq!(carrier.max_open_calls(), 2);
    }

    #[tokio::test]
    async fn scripted_outcomes_fire_in_order() {
        let carrier = MockCarrier::new();
        carrier.push_outcome(MockDialOutcome::Upstream);
        let request = DialRequest {
            to: "+919999999999".into(),
            from: "080307".into(),
            caller_id: "080307".into(),
            app_id: "applet".into(),
            call_log_id: CallLogId::new(),
            credentials: CarrierCredentials {
                account_sid: "sid".into(),
                api_key: "k".into(),
                api_token: "t".into(),
                subdomain: "api.exotel.com".into(),
            },
            status_callback: None,
        };

        assert!(carrier.initiate(&request).await.is_err());
        // Script exhausted: default outcome answers.
        let result = carrier.initiate(&request).await.unwrap();
        assert_eq!(result.status, CallStatus::InProgress);
    }

    #[tokio::test]
    async fn memory_store_dedupes_contact_phone_numbers() {
        let store = MemoryCampaignStore::new();
        let campaign = Campaign::builder()
            .user_id(crate::common::UserId::new())
            .agent_id(crate::common::AgentId::new())
            .phone_id(crate::common::PhoneId::new())
            .name("c")
            .build();
        store.insert_campaign(&campaign).await.unwrap();

        let contacts = vec![
            NewContact::builder().phone_number("+911111111111").build(),
            NewContact::builder().phone_number("+911111111111").build(),
            NewContact::builder().phone_number("+912222222222").build(),
        ];
        let inserted = store.insert_contacts(campaign.id, &contacts).await.unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(
            store.campaign(campaign.id).unwrap().total_contacts,
            2
        );
    }

    #[tokio::test]
    async fn finalize_call_log_is_idempotent() {
        let store = MemoryCampaignStore::new();
        let log = CallLog::builder()
            .user_id(crate::common::UserId::new())
            .campaign_id(CampaignId::new())
            .contact_id(ContactId::new())
            .agent_id(crate::common::AgentId::new())
            .phone_id(crate::common::PhoneId::new())
            .job_id(crate::common::JobId::new())
            .build();
        store.insert_call_log(&log).await.unwrap();

        let first = store
            .finalize_call_log(log.id, CallLogStatus::Completed, Some(30), None)
            .await
            .unwrap();
        assert!(first);
        let second = store
            .finalize_call_log(log.id, CallLogStatus::Completed, Some(30), None)
            .await
            .unwrap();
        assert!(!second);
    }
}
