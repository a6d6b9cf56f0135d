pub mod call_log;
pub mod campaign;
pub mod contact;

pub use call_log::{CallLog, CallLogStatus};
pub use campaign::{Campaign, CampaignSettings, CampaignStatus, CounterDelta, PriorityMode};
pub use contact::{CampaignContact, ContactStatus, NewContact};
