//! Campaign model: one batch of contacts dialed by one agent under one
//! concurrency ceiling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{AgentId, CampaignId, PhoneId, UserId};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "campaign_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Draft,
    Scheduled,
    Active,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl CampaignStatus {
    /// Allowed status transitions. Everything else is rejected by the API.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Active)
                | (Scheduled, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Paused, Cancelled)
                | (Scheduled, Cancelled)
                | (Active, Failed)
        )
    }

    pub fn is_startable(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Draft | CampaignStatus::Scheduled | CampaignStatus::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriorityMode {
    #[default]
    Fifo,
    Lifo,
    Priority,
}

// ============================================================================
// Settings
// ============================================================================

/// Per-campaign dialing settings, stored as JSONB.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignSettings {
    pub retry_failed_calls: bool,
    pub max_retry_attempts: u32,
    pub retry_delay_minutes: u32,
    pub exclude_voicemail: bool,
    pub priority_mode: PriorityMode,
    pub concurrent_calls_limit: u32,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            retry_failed_calls: false,
            max_retry_attempts: 2,
            retry_delay_minutes: 30,
            exclude_voicemail: true,
            priority_mode: PriorityMode::Fifo,
            concurrent_calls_limit: 5,
        }
    }
}

impl CampaignSettings {
    pub const LIMIT_RANGE: std::ops::RangeInclusive<u32> = 1..=50;
    pub const RETRY_RANGE: std::ops::RangeInclusive<u32> = 0..=10;

    /// Clamp out-of-range values instead of rejecting them; callers get the
    /// nearest valid configuration.
    pub fn clamped(mut self) -> Self {
        self.concurrent_calls_limit = self
            .concurrent_calls_limit
            .clamp(*Self::LIMIT_RANGE.start(), *Self::LIMIT_RANGE.end());
        self.max_retry_attempts = self
            .max_retry_attempts
            .min(*Self::RETRY_RANGE.end());
        self
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retry_delay_minutes as i64)
    }
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Campaign {
    #[builder(default = CampaignId::new())]
    pub id: CampaignId,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub phone_id: PhoneId,
    pub name: String,

    #[builder(default)]
    pub status: CampaignStatus,

    // Progress counters
    #[builder(default = 0)]
    pub total_contacts: i32,
    #[builder(default = 0)]
    pub queued_calls: i32,
    #[builder(default = 0)]
    pub active_calls: i32,
    #[builder(default = 0)]
    pub completed_calls: i32,
    #[builder(default = 0)]
    pub failed_calls: i32,
    #[builder(default = 0)]
    pub voicemail_calls: i32,

    #[builder(default = Json(CampaignSettings::default()))]
    pub settings: Json<CampaignSettings>,

    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub paused_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Settled calls (completed, failed, voicemail) so far.
    pub fn settled_calls(&self) -> i32 {
        self.completed_calls + self.failed_calls + self.voicemail_calls
    }

    /// Whether every contact has reached a settled state.
    pub fn is_drained(&self) -> bool {
        self.queued_calls <= 0 && self.active_calls <= 0
    }

    /// Progress counter invariant from the data model.
    pub fn counters_consistent(&self) -> bool {
        self.queued_calls + self.active_calls + self.settled_calls() <= self.total_contacts
    }
}

/// Signed deltas applied to a campaign's progress counters in one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub queued: i32,
    pub active: i32,
    pub completed: i32,
    pub failed: i32,
    pub voicemail: i32,
}

impl CounterDelta {
    pub fn queued(n: i32) -> Self {
        Self {
            queued: n,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign() -> Campaign {
        Campaign::builder()
            .user_id(UserId::new())
            .agent_id(AgentId::new())
            .phone_id(PhoneId::new())
            .name("test campaign")
            .build()
    }

    #[test]
    fn new_campaign_is_draft() {
        assert_eq!(campaign().status, CampaignStatus::Draft);
    }

    #[test]
    fn draft_can_start_paused_can_resume() {
        assert!(CampaignStatus::Draft.can_transition_to(CampaignStatus::Active));
        assert!(CampaignStatus::Paused.can_transition_to(CampaignStatus::Active));
        assert!(CampaignStatus::Active.can_transition_to(CampaignStatus::Paused));
    }

    #[test]
    fn terminal_states_do_not_restart() {
        assert!(!CampaignStatus::Completed.can_transition_to(CampaignStatus::Active));
        assert!(!CampaignStatus::Cancelled.can_transition_to(CampaignStatus::Active));
        assert!(!CampaignStatus::Completed.is_startable());
    }

    #[test]
    fn settings_clamp_limits() {
        let settings = CampaignSettings {
            concurrent_calls_limit: 200,
            max_retry_attempts: 99,
            ..Default::default()
        }
        .clamped();
        assert_eq!(settings.concurrent_calls_limit, 50);
        assert_eq!(settings.max_retry_attempts, 10);

        let settings = CampaignSettings {
            concurrent_calls_limit: 0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(settings.concurrent_calls_limit, 1);
    }

    #[test]
    fn counter_invariant_holds_for_fresh_campaign() {
        let mut c = campaign();
        c.total_contacts = 10;
        c.queued_calls = 4;
        c.active_calls = 2;
        c.completed_calls = 3;
        assert!(c.counters_consistent());
        assert!(!c.is_drained());

        c.queued_calls = 0;
        c.active_calls = 0;
        assert!(c.is_drained());
    }
}
