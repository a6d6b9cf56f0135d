// https://developer.exotel.com/api/make-a-call-api

use std::collections::HashMap;
use std::time::Duration;

pub mod models;

use reqwest::{Client, StatusCode};

pub use crate::models::{Call, CallResponse, CallStatus};

/// Per-account credentials for the Exotel REST API.
///
/// Accounts resolve to a subdomain-specific base URL; the caller is
/// responsible for decrypting per-phone credentials before building options.
#[derive(Debug, Clone)]
pub struct ExotelOptions {
    pub account_sid: String,
    pub api_key: String,
    pub api_token: String,
    /// e.g. "api.exotel.com" or a regional subdomain.
    pub subdomain: String,
}

impl ExotelOptions {
    fn base_url(&self) -> String {
        format!(
            "https://{}/v1/Accounts/{}",
            self.subdomain, self.account_sid
        )
    }
}

/// Errors returned by the Exotel client, classified so callers can decide
/// between retry, backoff, and credential disablement.
#[derive(Debug, thiserror::Error)]
pub enum ExotelError {
    /// 401/403 - credentials are bad; retrying will not help.
    #[error("exotel rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    /// 429 - rate limited by the carrier.
    #[error("exotel rate limited the request: {body}")]
    RateLimited { body: String },

    /// 5xx - carrier-side failure.
    #[error("exotel server error ({status}): {body}")]
    Server { status: u16, body: String },

    /// Any other non-success status (4xx data errors, unknown numbers, etc).
    #[error("exotel returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Request timed out before the carrier answered.
    #[error("exotel request timed out")]
    Timeout,

    #[error("exotel transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to parse exotel response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ExotelError {
    /// Whether the caller may retry the request after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExotelError::RateLimited { .. }
                | ExotelError::Server { .. }
                | ExotelError::Timeout
                | ExotelError::Transport(_)
        )
    }

    /// Whether the error indicates the credentials themselves are bad.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ExotelError::Unauthorized { .. })
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => ExotelError::Unauthorized {
                status: status.as_u16(),
                body,
            },
            429 => ExotelError::RateLimited { body },
            s if s >= 500 => ExotelError::Server { status: s, body },
            s => ExotelError::Api { status: s, body },
        }
    }
}

/// Parameters for an outbound call-connect request.
#[derive(Debug, Clone)]
pub struct ConnectCallParams {
    /// Destination number in E.164 form.
    pub to: String,
    /// The ExoPhone (virtual number) making the call.
    pub from: String,
    /// Caller id shown to the callee; usually the same ExoPhone.
    pub caller_id: String,
    /// Voice applet / flow id the answered call is bridged to.
    pub app_id: String,
    /// Opaque correlator echoed back on every status callback.
    pub custom_field: String,
    /// Where Exotel posts status callbacks.
    pub status_callback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExotelService {
    options: ExotelOptions,
    client: Client,
}

impl ExotelService {
    pub fn new(options: ExotelOptions) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { options, client }
    }

    /// Build a service that shares an existing HTTP client (connection pool).
    pub fn with_client(options: ExotelOptions, client: Client) -> Self {
        Self { options, client }
    }

    /// Initiate an outbound call through the connect applet flow.
    ///
    /// The returned status is the carrier's immediate view (usually
    /// `queued`); callers poll `get_call` or wait for status callbacks to
    /// observe ringing / in-progress.
    pub async fn connect_call(&self, params: &ConnectCallParams) -> Result<Call, ExotelError> {
        let url = format!("{}/Calls/connect.json", self.options.base_url());

        let flow_url = format!(
            "http://my.exotel.com/{}/exoml/start_voice/{}",
            self.options.account_sid, params.app_id
        );

        let mut form: HashMap<&str, String> = HashMap::new();
        form.insert("From", params.from.clone());
        form.insert("To", params.to.clone());
        form.insert("CallerId", params.caller_id.clone());
        form.insert("Url", flow_url);
        form.insert("CallType", "trans".to_string());
        form.insert("CustomField", params.custom_field.clone());
        if let Some(callback) = &params.status_callback {
            form.insert("StatusCallback", callback.clone());
            form.insert("StatusCallbackContentType", "application/json".to_string());
        }

        let response = self
            .client
            .post(url)
            .basic_auth(&self.options.api_key, Some(&self.options.api_token))
            .form(&form)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ExotelError::from_status(status, body));
        }

        let parsed: CallResponse = serde_json::from_str(&body)?;
        Ok(parsed.call)
    }

    /// Fetch the current details of a call by sid.
    pub async fn get_call(&self, call_sid: &str) -> Result<Call, ExotelError> {
        let url = format!("{}/Calls/{}.json", self.options.base_url(), call_sid);

        let response = self
            .client
            .get(url)
            .basic_auth(&self.options.api_key, Some(&self.options.api_token))
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ExotelError::from_status(status, body));
        }

        let parsed: CallResponse = serde_json::from_str(&body)?;
        Ok(parsed.call)
    }

    /// Terminate an in-progress call.
    ///
    /// Exotel treats this as a status update to `completed`; terminating an
    /// already-finished call is not an error.
    pub async fn hangup_call(&self, call_sid: &str) -> Result<(), ExotelError> {
        let url = format!("{}/Calls/{}.json", self.options.base_url(), call_sid);

        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("Status", "completed");

        let response = self
            .client
            .post(url)
            .basic_auth(&self.options.api_key, Some(&self.options.api_token))
            .form(&form)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(ExotelError::from_status(status, body));
        }

        Ok(())
    }
}

fn map_send_error(err: reqwest::Error) -> ExotelError {
    if err.is_timeout() {
        ExotelError::Timeout
    } else {
        ExotelError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ExotelOptions {
        ExotelOptions {
            account_sid: "troika1".to_string(),
            api_key: "key".to_string(),
            api_token: "token".to_string(),
            subdomain: "api.exotel.com".to_string(),
        }
    }

    #[test]
    fn base_url_includes_account_sid() {
        assert_eq!(
            options().base_url(),
            "https://api.exotel.com/v1/Accounts/troika1"
        );
    }

    #[test]
    fn unauthorized_is_not_retryable() {
        let err = ExotelError::Unauthorized {
            status: 401,
            body: String::new(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_auth_failure());
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert!(ExotelError::RateLimited { body: String::new() }.is_retryable());
        assert!(
            ExotelError::Server {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(ExotelError::Timeout.is_retryable());
    }

    #[test]
    fn status_mapping_classifies_families() {
        let err = ExotelError::from_status(StatusCode::FORBIDDEN, String::new());
        assert!(matches!(err, ExotelError::Unauthorized { status: 403, .. }));

        let err = ExotelError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(matches!(err, ExotelError::RateLimited { .. }));

        let err = ExotelError::from_status(StatusCode::BAD_GATEWAY, String::new());
        assert!(matches!(err, ExotelError::Server { status: 502, .. }));

        let err = ExotelError::from_status(StatusCode::BAD_REQUEST, String::new());
        assert!(matches!(err, ExotelError::Api { status: 400, .. }));
    }
}
