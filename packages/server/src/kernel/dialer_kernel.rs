// DialerKernel - core infrastructure with all dependencies
//
// Holds the dispatch core's injected dependencies (store, coordinator,
// carrier, phone directory) behind traits for testability. Infrastructure
// only; campaign business logic lives in domains/.

use std::sync::Arc;

use crate::config::{ColdStartConfig, Config, OffPeakHours, SweepConfig};
use crate::coordinator::Coordinator;
use crate::domains::campaigns::store::CampaignStore;

use super::carrier::{Carrier, PhoneDirectory};

/// The dispatch-relevant slice of [`Config`], cloned into the kernel so
/// services do not carry the full environment config around.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// System-wide ceiling fallback when a campaign has no limit key.
    pub max_concurrent_outbound_calls: u32,
    pub sweeps: SweepConfig,
    pub cold_start: ColdStartConfig,
    pub off_peak: OffPeakHours,
    pub webhook_base_url: Option<String>,
}

impl From<&Config> for DispatchConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_outbound_calls: config.max_concurrent_outbound_calls,
            sweeps: config.sweeps.clone(),
            cold_start: config.cold_start.clone(),
            off_peak: config.off_peak.clone(),
            webhook_base_url: config.webhook_base_url.clone(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_outbound_calls: 10,
            sweeps: SweepConfig::default(),
            cold_start: ColdStartConfig::default(),
            off_peak: OffPeakHours::default(),
            webhook_base_url: None,
        }
    }
}

/// DialerKernel holds all dispatch-core dependencies.
pub struct DialerKernel {
    pub store: Arc<dyn CampaignStore>,
    pub coordinator: Arc<dyn Coordinator>,
    pub carrier: Arc<dyn Carrier>,
    pub phones: Arc<dyn PhoneDirectory>,
    pub config: DispatchConfig,
}

impl DialerKernel {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        coordinator: Arc<dyn Coordinator>,
        carrier: Arc<dyn Carrier>,
        phones: Arc<dyn PhoneDirectory>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            carrier,
            phones,
            config,
        }
    }
}
