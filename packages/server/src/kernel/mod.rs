// Kernel - core infrastructure with dependency injection
//
// The DialerKernel holds all server dependencies (store, coordinator,
// carrier) and provides dependency injection through traits for testability.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domain layers and the dispatch engine.

pub mod carrier;
pub mod dialer_kernel;
pub mod limits;
pub mod service_host;
pub mod test_dependencies;

pub use carrier::{
    Carrier, CarrierCredentials, CarrierError, DialRequest, DialResult, ExotelCarrier,
    PhoneDirectory, PhoneProfile, StaticPhoneDirectory,
};
pub use dialer_kernel::{DialerKernel, DispatchConfig};
pub use limits::{CircuitBreaker, RateLimiter};
pub use service_host::{Service, ServiceHost};
pub use test_dependencies::{MemoryCampaignStore, MockCarrier, MockDialOutcome};
