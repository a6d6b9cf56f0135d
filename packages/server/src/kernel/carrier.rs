//! Carrier seam: the trait the call worker dials through, plus the Exotel
//! implementation wrapped in client-side throttling and a circuit breaker.

use std::sync::Arc;

use async_trait::async_trait;
use exotel::{CallStatus, ConnectCallParams, ExotelError, ExotelOptions, ExotelService};

use crate::common::CallLogId;
use crate::config::ExotelConfig;

use super::limits::{CircuitBreaker, RateLimiter};

/// Already-resolved credentials for the phone making a call. Per-phone
/// credential decryption happens upstream; the core only sees these.
#[derive(Debug, Clone)]
pub struct CarrierCredentials {
    pub account_sid: String,
    pub api_key: String,
    pub api_token: String,
    pub subdomain: String,
}

impl From<&ExotelConfig> for CarrierCredentials {
    fn from(config: &ExotelConfig) -> Self {
        Self {
            account_sid: config.account_sid.clone(),
            api_key: config.api_key.clone(),
            api_token: config.api_token.clone(),
            subdomain: config.subdomain.clone(),
        }
    }
}

impl CarrierCredentials {
    fn options(&self) -> ExotelOptions {
        ExotelOptions {
            account_sid: self.account_sid.clone(),
            api_key: self.api_key.clone(),
            api_token: self.api_token.clone(),
            subdomain: self.subdomain.clone(),
        }
    }
}

/// One outbound dial request.
#[derive(Debug, Clone)]
pub struct DialRequest {
    /// Destination, E.164.
    pub to: String,
    /// ExoPhone making the call.
    pub from: String,
    pub caller_id: String,
    /// Voice applet the answered call is bridged to.
    pub app_id: String,
    /// Webhook correlator, echoed back as the carrier CustomField.
    pub call_log_id: CallLogId,
    pub credentials: CarrierCredentials,
    pub status_callback: Option<String>,
}

/// Carrier view of a call after initiate/get_details.
#[derive(Debug, Clone)]
pub struct DialResult {
    pub sid: String,
    pub status: CallStatus,
}

/// Carrier error taxonomy the worker maps to retry / fatal decisions.
#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    /// 401/403: the phone's credentials are bad. Not retryable; disables
    /// the phone upstream.
    #[error("carrier rejected credentials: {0}")]
    AuthRejected(String),

    /// 429: back off and retry.
    #[error("carrier rate limited: {0}")]
    RateLimited(String),

    /// 5xx: retry behind the circuit breaker.
    #[error("carrier upstream failure: {0}")]
    Upstream(String),

    #[error("carrier request timed out")]
    Timeout,

    /// Local breaker refused the call without hitting the carrier.
    #[error("carrier circuit breaker is open")]
    CircuitOpen,

    /// 4xx data errors (bad number, missing applet): never retried.
    #[error("carrier rejected the call: {0}")]
    Rejected(String),

    #[error("carrier transport error: {0}")]
    Transport(String),
}

impl CarrierError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CarrierError::RateLimited(_)
                | CarrierError::Upstream(_)
                | CarrierError::Timeout
                | CarrierError::CircuitOpen
                | CarrierError::Transport(_)
        )
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, CarrierError::AuthRejected(_))
    }

    /// Failures that should rewind the cold-start ramp.
    pub fn is_sustained_failure(&self) -> bool {
        matches!(self, CarrierError::Upstream(_) | CarrierError::AuthRejected(_))
    }
}

impl From<ExotelError> for CarrierError {
    fn from(err: ExotelError) -> Self {
        match err {
            ExotelError::Unauthorized { body, .. } => CarrierError::AuthRejected(body),
            ExotelError::RateLimited { body } => CarrierError::RateLimited(body),
            ExotelError::Server { body, .. } => CarrierError::Upstream(body),
            ExotelError::Timeout => CarrierError::Timeout,
            ExotelError::Api { status, body } => {
                CarrierError::Rejected(format!("{status}: {body}"))
            }
            ExotelError::Transport(e) => CarrierError::Transport(e.to_string()),
            ExotelError::Parse(e) => CarrierError::Transport(e.to_string()),
        }
    }
}

/// The abstract telephony carrier the dispatch core drives.
#[async_trait]
pub trait Carrier: Send + Sync {
    async fn initiate(&self, request: &DialRequest) -> Result<DialResult, CarrierError>;

    async fn hangup(
        &self,
        credentials: &CarrierCredentials,
        sid: &str,
    ) -> Result<(), CarrierError>;

    async fn get_details(
        &self,
        credentials: &CarrierCredentials,
        sid: &str,
    ) -> Result<DialResult, CarrierError>;
}

// ============================================================================
// Phone directory
// ============================================================================

/// Resolved dialing profile for one campaign phone: the ExoPhone, caller id,
/// applet, and decrypted credentials.
#[derive(Debug, Clone)]
pub struct PhoneProfile {
    pub from: String,
    pub caller_id: String,
    pub app_id: String,
    pub credentials: CarrierCredentials,
}

/// Resolves a campaign's phone id to its dialing profile. Credential
/// decryption lives behind this seam; the dispatch core never sees
/// ciphertext.
#[async_trait]
pub trait PhoneDirectory: Send + Sync {
    async fn resolve(&self, phone_id: crate::common::PhoneId) -> anyhow::Result<PhoneProfile>;
}

/// Single-profile directory backed by environment configuration; every phone
/// id resolves to the same account. Deployments with per-phone credentials
/// replace this with a store-backed directory.
pub struct StaticPhoneDirectory {
    profile: PhoneProfile,
}

impl StaticPhoneDirectory {
    pub fn new(profile: PhoneProfile) -> Self {
        Self { profile }
    }

    pub fn from_config(config: &ExotelConfig, from: String, app_id: String) -> Self {
        Self {
            profile: PhoneProfile {
                caller_id: from.clone(),
                from,
                app_id,
                credentials: CarrierCredentials::from(config),
            },
        }
    }
}

#[async_trait]
impl PhoneDirectory for StaticPhoneDirectory {
    async fn resolve(&self, _phone_id: crate::common::PhoneId) -> anyhow::Result<PhoneProfile> {
        Ok(self.profile.clone())
    }
}

// ============================================================================
// Exotel implementation
// ============================================================================

/// Exotel-backed carrier with a token-bucket rate limit and circuit breaker
/// around every request.
pub struct ExotelCarrier {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl ExotelCarrier {
    pub fn new() -> Self {
        Self::with_limits(
            Arc::new(RateLimiter::for_carrier()),
            Arc::new(CircuitBreaker::for_carrier()),
        )
    }

    pub fn with_limits(limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            limiter,
            breaker,
        }
    }

    fn service(&self, credentials: &CarrierCredentials) -> ExotelService {
        ExotelService::with_client(credentials.options(), self.http.clone())
    }

    fn record<T>(&self, result: &Result<T, CarrierError>) {
        match result {
            Ok(_) => self.breaker.record_success(),
            // Data rejections are not carrier-health signals.
            Err(e) if e.is_retryable() && !matches!(e, CarrierError::CircuitOpen) => {
                self.breaker.record_failure()
            }
            Err(_) => {}
        }
    }
}

impl Default for ExotelCarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Carrier for ExotelCarrier {
    async fn initiate(&self, request: &DialRequest) -> Result<DialResult, CarrierError> {
        if !self.breaker.allow() {
            return Err(CarrierError::CircuitOpen);
        }
        let _permit = self.limiter.acquire().await;

        let params = ConnectCallParams {
            to: request.to.clone(),
            from: request.from.clone(),
            caller_id: request.caller_id.clone(),
            app_id: request.app_id.clone(),
            custom_field: request.call_log_id.to_string(),
            status_callback: request.status_callback.clone(),
        };
        let result = self
            .service(&request.credentials)
            .connect_call(&params)
            .await
            .map(|call| DialResult {
                sid: call.sid,
                status: call.status,
            })
            .map_err(CarrierError::from);
        self.record(&result);
        result
    }

    async fn hangup(
        &self,
        credentials: &CarrierCredentials,
        sid: &str,
    ) -> Result<(), CarrierError> {
        if !self.breaker.allow() {
            return Err(CarrierError::CircuitOpen);
        }
        let _permit = self.limiter.acquire().await;
        let result = self
            .service(credentials)
            .hangup_call(sid)
            .await
            .map_err(CarrierError::from);
        self.record(&result);
        result
    }

    async fn get_details(
        &self,
        credentials: &CarrierCredentials,
        sid: &str,
    ) -> Result<DialResult, CarrierError> {
        if !self.breaker.allow() {
            return Err(CarrierError::CircuitOpen);
        }
        let _permit = self.limiter.acquire().await;
        let result = self
            .service(credentials)
            .get_call(sid)
            .await
            .map(|call| DialResult {
                sid: call.sid,
                status: call.status,
            })
            .map_err(CarrierError::from);
        self.record(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exotel_errors_map_to_taxonomy() {
        let err = CarrierError::from(ExotelError::Unauthorized {
            status: 401,
            body: "bad key".into(),
        });
        assert!(err.is_auth_failure());
        assert!(!err.is_retryable());

        let err = CarrierError::from(ExotelError::Server {
            status: 503,
            body: String::new(),
        });
        assert!(err.is_retryable());
        assert!(err.is_sustained_failure());

        let err = CarrierError::from(ExotelError::Api {
            status: 400,
            body: "bad number".into(),
        });
        assert!(!err.is_retryable());
        assert!(!err.is_sustained_failure());
    }

    #[test]
    fn circuit_open_is_retryable_but_not_sustained() {
        assert!(CarrierError::CircuitOpen.is_retryable());
        assert!(!CarrierError::CircuitOpen.is_sustained_failure());
    }
}
