//! Durable store access for campaigns, contacts, and call logs.
//!
//! The trait is the seam between the dispatch core and Postgres; the test
//! suite swaps in the in-memory implementation from
//! `kernel::test_dependencies`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::common::{CallLogId, CampaignId, ContactId};

use super::models::{
    CallLog, CallLogStatus, Campaign, CampaignContact, CampaignStatus, ContactStatus,
    CounterDelta, NewContact,
};

const CAMPAIGN_COLUMNS: &str = r#"
    id, user_id, agent_id, phone_id, name, status,
    total_contacts, queued_calls, active_calls, completed_calls, failed_calls, voicemail_calls,
    settings, scheduled_at, started_at, paused_at, completed_at, created_at, updated_at
"#;

const CONTACT_COLUMNS: &str = r#"
    id, campaign_id, phone_number, priority, retry_count, next_retry_at,
    status, voicemail, custom_data, created_at, updated_at
"#;

const CALL_LOG_COLUMNS: &str = r#"
    id, user_id, campaign_id, contact_id, agent_id, phone_id, job_id,
    exotel_call_sid, status, lease_token, duration_secs, recording_url,
    finalized_at, created_at, updated_at
"#;

/// Typed CRUD over the dialer's durable aggregates.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    // --- campaigns ---

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()>;
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Compare-and-swap status transition; stamps the matching timestamp
    /// column. Returns false when the campaign was not in any `from` status.
    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool>;

    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>>;

    /// Apply signed deltas to the progress counters.
    async fn apply_counter_delta(&self, id: CampaignId, delta: CounterDelta) -> Result<()>;

    // --- contacts ---

    /// Insert contacts, skipping duplicates on (campaign_id, phone_number).
    /// Returns the number actually inserted; bumps `total_contacts`.
    async fn insert_contacts(&self, campaign: CampaignId, contacts: &[NewContact])
        -> Result<u32>;

    async fn get_contact(&self, id: ContactId) -> Result<Option<CampaignContact>>;

    /// Pending contacts ordered (priority desc, created_at asc).
    async fn pending_contacts(&self, campaign: CampaignId) -> Result<Vec<CampaignContact>>;

    async fn set_contact_status(&self, id: ContactId, status: ContactStatus) -> Result<()>;

    /// Settle a contact after a terminal call outcome.
    async fn finalize_contact(
        &self,
        id: ContactId,
        status: ContactStatus,
        voicemail: bool,
    ) -> Result<()>;

    /// Stamp when a failed contact becomes eligible for its next attempt.
    async fn schedule_contact_retry(
        &self,
        id: ContactId,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Claim a failed contact for a retry attempt: bump `retry_count`, move
    /// to queued, clear the eligibility stamp. Returns false when the
    /// contact is no longer failed.
    async fn begin_contact_retry(&self, id: ContactId) -> Result<bool>;

    /// Contacts whose retry eligibility stamp has passed.
    async fn contacts_due_for_retry(
        &self,
        campaign: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignContact>>;

    /// All failed contacts for a campaign (manual retry path).
    async fn failed_contacts(&self, campaign: CampaignId) -> Result<Vec<CampaignContact>>;

    /// Mark all pending/queued contacts skipped (campaign cancel). Returns
    /// the number affected.
    async fn skip_unsettled_contacts(&self, campaign: CampaignId) -> Result<u64>;

    // --- call logs ---

    async fn insert_call_log(&self, log: &CallLog) -> Result<()>;
    async fn get_call_log(&self, id: CallLogId) -> Result<Option<CallLog>>;
    async fn find_call_log_by_sid(&self, sid: &str) -> Result<Option<CallLog>>;

    async fn set_call_sid(&self, id: CallLogId, sid: &str, status: CallLogStatus) -> Result<()>;

    /// Persist the active lease token after a successful upgrade.
    async fn set_call_lease_token(
        &self,
        id: CallLogId,
        token: &str,
        status: CallLogStatus,
    ) -> Result<()>;

    async fn update_call_status(&self, id: CallLogId, status: CallLogStatus) -> Result<()>;

    /// Write the terminal outcome exactly once. Returns false when the log
    /// was already finalized (duplicate webhook).
    async fn finalize_call_log(
        &self,
        id: CallLogId,
        status: CallLogStatus,
        duration_secs: Option<i32>,
        recording_url: Option<&str>,
    ) -> Result<bool>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PostgresCampaignStore {
    pool: PgPool,
}

impl PostgresCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignStore for PostgresCampaignStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, user_id, agent_id, phone_id, name, status,
                total_contacts, queued_calls, active_calls, completed_calls, failed_calls, voicemail_calls,
                settings, scheduled_at, started_at, paused_at, completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(campaign.id)
        .bind(campaign.user_id)
        .bind(campaign.agent_id)
        .bind(campaign.phone_id)
        .bind(&campaign.name)
        .bind(campaign.status)
        .bind(campaign.total_contacts)
        .bind(campaign.queued_calls)
        .bind(campaign.active_calls)
        .bind(campaign.completed_calls)
        .bind(campaign.failed_calls)
        .bind(campaign.voicemail_calls)
        .bind(&campaign.settings)
        .bind(campaign.scheduled_at)
        .bind(campaign.started_at)
        .bind(campaign.paused_at)
        .bind(campaign.completed_at)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let campaign = sqlx::query_as::<_, Campaign>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(campaign)
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        let timestamp_column = match to {
            CampaignStatus::Active => "started_at",
            CampaignStatus::Paused => "paused_at",
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed => {
                "completed_at"
            }
            _ => "updated_at",
        };
        let result = sqlx::query(&format!(
            r#"
            UPDATE campaigns
            SET status = $1, {timestamp_column} = NOW(), updated_at = NOW()
            WHERE id = $2 AND status = ANY($3)
            "#
        ))
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>> {
        let campaigns = sqlx::query_as::<_, Campaign>(&format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS}
            FROM campaigns
            WHERE status = 'active'
            ORDER BY created_at
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(campaigns)
    }

    async fn apply_counter_delta(&self, id: CampaignId, delta: CounterDelta) -> Result<()> {
        if delta.is_noop() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE campaigns
            SET queued_calls = GREATEST(0, queued_calls + $1),
                active_calls = GREATEST(0, active_calls + $2),
                completed_calls = GREATEST(0, completed_calls + $3),
                failed_calls = GREATEST(0, failed_calls + $4),
                voicemail_calls = GREATEST(0, voicemail_calls + $5),
                updated_at = NOW()
            WHERE id = $6
            "#,
        )
        .bind(delta.queued)
        .bind(delta.active)
        .bind(delta.completed)
        .bind(delta.failed)
        .bind(delta.voicemail)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_contacts(
        &self,
        campaign: CampaignId,
        contacts: &[NewContact],
    ) -> Result<u32> {
        let mut inserted = 0u32;
        for contact in contacts {
            let result = sqlx::query(
                r#"
                INSERT INTO campaign_contacts (
                    id, campaign_id, phone_number, priority, retry_count,
                    status, voicemail, custom_data, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, 0, 'pending', false, $5, NOW(), NOW())
                ON CONFLICT (campaign_id, phone_number) DO NOTHING
                "#,
            )
            .bind(ContactId::new())
            .bind(campaign)
            .bind(&contact.phone_number)
            .bind(contact.priority)
            .bind(contact.custom_data.as_ref().map(sqlx::types::Json))
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected() as u32;
        }
        if inserted > 0 {
            sqlx::query(
                "UPDATE campaigns SET total_contacts = total_contacts + $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(inserted as i32)
            .bind(campaign)
            .execute(&self.pool)
            .await?;
        }
        Ok(inserted)
    }

    async fn get_contact(&self, id: ContactId) -> Result<Option<CampaignContact>> {
        let contact = sqlx::query_as::<_, CampaignContact>(&format!(
            "SELECT {CONTACT_COLUMNS} FROM campaign_contacts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contact)
    }

    async fn pending_contacts(&self, campaign: CampaignId) -> Result<Vec<CampaignContact>> {
        let contacts = sqlx::query_as::<_, CampaignContact>(&format!(
            r#"
            SELECT {CONTACT_COLUMNS}
            FROM campaign_contacts
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY priority DESC, created_at ASC
            "#
        ))
        .bind(campaign)
        .fetch_all(&self.pool)
        .await?;
        Ok(contacts)
    }

    async fn set_contact_status(&self, id: ContactId, status: ContactStatus) -> Result<()> {
        sqlx::query("UPDATE campaign_contacts SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finalize_contact(
        &self,
        id: ContactId,
        status: ContactStatus,
        voicemail: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_contacts
            SET status = $1, voicemail = voicemail OR $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status)
        .bind(voicemail)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_contact_retry(
        &self,
        id: ContactId,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE campaign_contacts SET next_retry_at = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(next_retry_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin_contact_retry(&self, id: ContactId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_contacts
            SET retry_count = retry_count + 1,
                status = 'queued',
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn contacts_due_for_retry(
        &self,
        campaign: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignContact>> {
        let contacts = sqlx::query_as::<_, CampaignContact>(&format!(
            r#"
            SELECT {CONTACT_COLUMNS}
            FROM campaign_contacts
            WHERE campaign_id = $1
              AND status = 'failed'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $2
            ORDER BY next_retry_at ASC
            "#
        ))
        .bind(campaign)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(contacts)
    }

    async fn failed_contacts(&self, campaign: CampaignId) -> Result<Vec<CampaignContact>> {
        let contacts = sqlx::query_as::<_, CampaignContact>(&format!(
            r#"
            SELECT {CONTACT_COLUMNS}
            FROM campaign_contacts
            WHERE campaign_id = $1 AND status = 'failed'
            ORDER BY priority DESC, created_at ASC
            "#
        ))
        .bind(campaign)
        .fetch_all(&self.pool)
        .await?;
        Ok(contacts)
    }

    async fn skip_unsettled_contacts(&self, campaign: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_contacts
            SET status = 'skipped', updated_at = NOW()
            WHERE campaign_id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(campaign)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_call_log(&self, log: &CallLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO call_logs (
                id, user_id, campaign_id, contact_id, agent_id, phone_id, job_id,
                exotel_call_sid, status, lease_token, duration_secs, recording_url,
                finalized_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(log.id)
        .bind(log.user_id)
        .bind(log.campaign_id)
        .bind(log.contact_id)
        .bind(log.agent_id)
        .bind(log.phone_id)
        .bind(log.job_id)
        .bind(&log.exotel_call_sid)
        .bind(log.status)
        .bind(&log.lease_token)
        .bind(log.duration_secs)
        .bind(&log.recording_url)
        .bind(log.finalized_at)
        .bind(log.created_at)
        .bind(log.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_call_log(&self, id: CallLogId) -> Result<Option<CallLog>> {
        let log = sqlx::query_as::<_, CallLog>(&format!(
            "SELECT {CALL_LOG_COLUMNS} FROM call_logs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(log)
    }

    async fn find_call_log_by_sid(&self, sid: &str) -> Result<Option<CallLog>> {
        let log = sqlx::query_as::<_, CallLog>(&format!(
            "SELECT {CALL_LOG_COLUMNS} FROM call_logs WHERE exotel_call_sid = $1"
        ))
        .bind(sid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(log)
    }

    async fn set_call_sid(&self, id: CallLogId, sid: &str, status: CallLogStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_logs
            SET exotel_call_sid = $1, status = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(sid)
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_call_lease_token(
        &self,
        id: CallLogId,
        token: &str,
        status: CallLogStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_logs
            SET lease_token = $1, status = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(token)
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_call_status(&self, id: CallLogId, status: CallLogStatus) -> Result<()> {
        sqlx::query("UPDATE call_logs SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finalize_call_log(
        &self,
        id: CallLogId,
        status: CallLogStatus,
        duration_secs: Option<i32>,
        recording_url: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE call_logs
            SET status = $1,
                duration_secs = COALESCE($2, duration_secs),
                recording_url = COALESCE($3, recording_url),
                finalized_at = NOW(),
                updated_at = NOW()
            WHERE id = $4 AND finalized_at IS NULL
            "#,
        )
        .bind(status)
        .bind(duration_secs)
        .bind(recording_url)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
