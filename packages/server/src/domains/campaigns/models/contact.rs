//! Campaign contact: one phone number with its own retry state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{CampaignId, ContactId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "contact_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    #[default]
    Pending,
    Queued,
    Calling,
    Completed,
    Failed,
    Skipped,
}

impl ContactStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ContactStatus::Completed | ContactStatus::Failed | ContactStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CampaignContact {
    #[builder(default = ContactId::new())]
    pub id: ContactId,
    pub campaign_id: CampaignId,
    /// E.164. Unique within one campaign.
    pub phone_number: String,
    /// Higher dials first.
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default, setter(strip_option))]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub status: ContactStatus,
    /// Whether the last settled attempt hit voicemail; gates retries when
    /// `exclude_voicemail` is on.
    #[builder(default = false)]
    pub voicemail: bool,
    #[builder(default, setter(strip_option))]
    pub custom_data: Option<sqlx::types::Json<serde_json::Value>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl CampaignContact {
    /// Whether another dial attempt is allowed under the campaign settings.
    pub fn retry_allowed(&self, max_retry_attempts: u32, exclude_voicemail: bool) -> bool {
        if self.retry_count >= max_retry_attempts as i32 {
            return false;
        }
        !(self.voicemail && exclude_voicemail)
    }
}

/// Input shape for contact ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewContact {
    pub phone_number: String,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub custom_data: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> CampaignContact {
        CampaignContact::builder()
            .campaign_id(CampaignId::new())
            .phone_number("+919876543210")
            .build()
    }

    #[test]
    fn new_contact_is_pending() {
        let c = contact();
        assert_eq!(c.status, ContactStatus::Pending);
        assert_eq!(c.retry_count, 0);
    }

    #[test]
    fn retry_is_bounded_by_max_attempts() {
        let mut c = contact();
        c.retry_count = 2;
        assert!(!c.retry_allowed(2, false));
        assert!(c.retry_allowed(3, false));
    }

    #[test]
    fn voicemail_blocks_retry_when_excluded() {
        let mut c = contact();
        c.voicemail = true;
        assert!(!c.retry_allowed(3, true));
        assert!(c.retry_allowed(3, false));
    }

    #[test]
    fn settled_statuses() {
        assert!(ContactStatus::Completed.is_settled());
        assert!(ContactStatus::Skipped.is_settled());
        assert!(!ContactStatus::Calling.is_settled());
    }
}
