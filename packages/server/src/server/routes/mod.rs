pub mod campaigns;
pub mod webhooks;

use std::sync::Arc;

use crate::domains::campaigns::CampaignApi;
use crate::kernel::DialerKernel;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<DialerKernel>,
    pub api: Arc<CampaignApi>,
}
