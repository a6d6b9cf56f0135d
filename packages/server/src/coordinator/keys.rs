//! Key layout for the coordinator substrate.
//!
//! Every per-campaign key embeds the campaign id in a `{...}` hash tag so a
//! clustered deployment colocates one campaign's keys on one shard, which is
//! what lets the Lua scripts touch several of them atomically.

use crate::common::{CampaignId, JobId};

/// Pub/sub channel for queue lifecycle events (JSON [`QueueEvent`]).
///
/// [`QueueEvent`]: super::QueueEvent
pub const QUEUE_EVENTS_CHANNEL: &str = "dial:events:queue";

/// Pub/sub channel for slot-available wakeups (payload: campaign id).
pub const SLOT_EVENTS_CHANNEL: &str = "dial:events:slots";

/// Key builder for one campaign's hash-tagged key space.
#[derive(Debug, Clone)]
pub struct CampaignKeys {
    tag: String,
}

impl CampaignKeys {
    pub fn new(campaign: CampaignId) -> Self {
        Self {
            tag: format!("dial:{{{campaign}}}"),
        }
    }

    pub fn limit(&self) -> String {
        format!("{}:limit", self.tag)
    }

    pub fn paused(&self) -> String {
        format!("{}:paused", self.tag)
    }

    /// Set of outstanding lease members (`pre-<callId>` or `<callId>`).
    pub fn leases(&self) -> String {
        format!("{}:leases", self.tag)
    }

    /// Per-member lease token string with TTL.
    pub fn lease(&self, member: &str) -> String {
        format!("{}:lease:{member}", self.tag)
    }

    pub fn lease_prefix(&self) -> String {
        format!("{}:lease:", self.tag)
    }

    pub fn reserved(&self) -> String {
        format!("{}:reserved", self.tag)
    }

    /// Sorted set `<origin>:<jobId>` -> reservation epoch ms.
    pub fn ledger(&self) -> String {
        format!("{}:ledger", self.tag)
    }

    pub fn waitlist(&self, lane: super::Lane) -> String {
        format!("{}:wait:{}", self.tag, lane.as_str())
    }

    pub fn marker(&self, job_id: JobId) -> String {
        format!("{}:marker:{job_id}", self.tag)
    }

    /// Dedup set of contact ids already enqueued.
    pub fn seen(&self) -> String {
        format!("{}:seen", self.tag)
    }

    /// Monotonic promotion sequence.
    pub fn gate(&self) -> String {
        format!("{}:gate", self.tag)
    }

    pub fn mutex(&self) -> String {
        format!("{}:mutex", self.tag)
    }

    pub fn breaker(&self) -> String {
        format!("{}:breaker", self.tag)
    }

    pub fn cold_start(&self) -> String {
        format!("{}:cold", self.tag)
    }

    pub fn cold_start_successes(&self) -> String {
        format!("{}:cold:ok", self.tag)
    }

    // --- deferred queue ---

    pub fn job(&self, job_id: JobId) -> String {
        format!("{}:job:{job_id}", self.tag)
    }

    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.tag)
    }

    /// Set of every job id ever enqueued for the campaign (cancel sweep).
    pub fn job_index(&self) -> String {
        format!("{}:jobs", self.tag)
    }

    /// Zset of parked jobs, score = deliver-at epoch ms.
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.tag)
    }

    /// List of promoted jobs awaiting a worker claim.
    pub fn waiting(&self) -> String {
        format!("{}:waiting", self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Lane;

    #[test]
    fn all_keys_share_the_hash_tag() {
        let campaign = CampaignId::new();
        let keys = CampaignKeys::new(campaign);
        let tag = format!("{{{campaign}}}");

        for key in [
            keys.limit(),
            keys.leases(),
            keys.lease("pre-abc"),
            keys.reserved(),
            keys.ledger(),
            keys.waitlist(Lane::High),
            keys.marker(JobId::new()),
            keys.seen(),
            keys.gate(),
            keys.mutex(),
            keys.breaker(),
            keys.cold_start(),
            keys.delayed(),
            keys.waiting(),
            keys.job_index(),
        ] {
            assert!(key.contains(&tag), "{key} is missing the hash tag");
        }
    }

    #[test]
    fn lanes_map_to_distinct_lists() {
        let keys = CampaignKeys::new(CampaignId::new());
        assert_ne!(keys.waitlist(Lane::High), keys.waitlist(Lane::Normal));
        assert!(keys.waitlist(Lane::High).ends_with(":wait:high"));
    }
}
