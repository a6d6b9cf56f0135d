//! Typed ID aliases for the dialer's domain entities.

pub use super::id::Id;

/// Marker type for Campaign entities.
pub struct Campaign;

/// Marker type for CampaignContact entities.
pub struct CampaignContact;

/// Marker type for CallLog entities (one row per initiation attempt).
pub struct CallLog;

/// Marker type for queue-resident dial jobs.
pub struct DialJob;

/// Marker type for Phone entities (carrier virtual numbers).
pub struct Phone;

/// Marker type for User (tenant) entities.
pub struct User;

/// Marker type for Agent (voice agent) entities.
pub struct Agent;

pub type CampaignId = Id<Campaign>;
pub type ContactId = Id<CampaignContact>;
pub type CallLogId = Id<CallLog>;
pub type JobId = Id<DialJob>;
pub type PhoneId = Id<Phone>;
pub type UserId = Id<User>;
pub type AgentId = Id<Agent>;
