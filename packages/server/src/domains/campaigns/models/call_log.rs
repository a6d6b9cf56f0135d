//! Call log: one row per initiation attempt, correlated with the carrier by
//! `exotel_call_sid` and with the webhook by the log's own id (sent as the
//! carrier `CustomField`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{AgentId, CallLogId, CampaignId, ContactId, JobId, PhoneId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "call_log_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallLogStatus {
    /// Created locally; carrier not yet (successfully) invoked.
    #[default]
    Initiated,
    Queued,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Voicemail,
}

impl CallLogStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallLogStatus::Completed
                | CallLogStatus::Failed
                | CallLogStatus::Busy
                | CallLogStatus::NoAnswer
                | CallLogStatus::Voicemail
        )
    }

    /// Whether the contact should count as successfully reached.
    pub fn is_success(&self) -> bool {
        matches!(self, CallLogStatus::Completed)
    }
}

impl From<exotel::CallStatus> for CallLogStatus {
    fn from(status: exotel::CallStatus) -> Self {
        match status {
            exotel::CallStatus::Queued => CallLogStatus::Queued,
            exotel::CallStatus::Ringing => CallLogStatus::Ringing,
            exotel::CallStatus::InProgress => CallLogStatus::InProgress,
            exotel::CallStatus::Completed => CallLogStatus::Completed,
            exotel::CallStatus::Failed => CallLogStatus::Failed,
            exotel::CallStatus::Busy => CallLogStatus::Busy,
            exotel::CallStatus::NoAnswer => CallLogStatus::NoAnswer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CallLog {
    #[builder(default = CallLogId::new())]
    pub id: CallLogId,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub agent_id: AgentId,
    pub phone_id: PhoneId,
    /// Queue job that initiated this attempt.
    pub job_id: JobId,

    #[builder(default, setter(strip_option))]
    pub exotel_call_sid: Option<String>,
    #[builder(default)]
    pub status: CallLogStatus,

    /// Active lease token, persisted on upgrade so the webhook handler can
    /// release the slot.
    #[builder(default, setter(strip_option))]
    pub lease_token: Option<String>,

    #[builder(default, setter(strip_option))]
    pub duration_secs: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub recording_url: Option<String>,

    /// Set exactly once by the webhook handler; the idempotency marker for
    /// duplicate deliveries.
    #[builder(default, setter(strip_option))]
    pub finalized_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl CallLog {
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(CallLogStatus::Completed.is_terminal());
        assert!(CallLogStatus::Voicemail.is_terminal());
        assert!(!CallLogStatus::Ringing.is_terminal());
        assert!(!CallLogStatus::Initiated.is_terminal());
    }

    #[test]
    fn carrier_status_maps_over() {
        assert_eq!(
            CallLogStatus::from(exotel::CallStatus::InProgress),
            CallLogStatus::InProgress
        );
        assert_eq!(
            CallLogStatus::from(exotel::CallStatus::NoAnswer),
            CallLogStatus::NoAnswer
        );
    }

    #[test]
    fn only_completed_counts_as_success() {
        assert!(CallLogStatus::Completed.is_success());
        assert!(!CallLogStatus::Busy.is_success());
    }
}
