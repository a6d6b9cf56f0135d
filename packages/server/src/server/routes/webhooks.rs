//! Carrier status webhook.
//!
//! Exotel posts status callbacks with the call log id echoed back in
//! `CustomField`; the sid is the fallback correlator. Always answers 200 so
//! the carrier does not retry data errors forever; duplicates are absorbed
//! by the idempotent finalize path.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::common::CallLogId;
use crate::domains::campaigns::store::CampaignStore;
use crate::domains::campaigns::models::CallLogStatus;
use crate::domains::campaigns::webhook::{finalize_call, CallStatusUpdate, FinalizeOutcome};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CallStatusBody {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "CustomField", default)]
    pub custom_field: Option<String>,
    #[serde(rename = "ConversationDuration", default)]
    pub duration_secs: Option<i32>,
    #[serde(rename = "RecordingUrl", default)]
    pub recording_url: Option<String>,
}

fn parse_status(raw: &str) -> Option<CallLogStatus> {
    if raw == "voicemail" {
        return Some(CallLogStatus::Voicemail);
    }
    raw.parse::<exotel::CallStatus>().ok().map(Into::into)
}

pub async fn call_status(
    State(state): State<AppState>,
    Json(body): Json<CallStatusBody>,
) -> Response {
    let Some(status) = parse_status(&body.status) else {
        warn!(status = %body.status, sid = %body.call_sid, "unparseable webhook status");
        return StatusCode::OK.into_response();
    };

    // CustomField carries the call log id; fall back to the sid index.
    let call_log_id: Option<CallLogId> = match body
        .custom_field
        .as_deref()
        .and_then(|field| field.parse().ok())
    {
        Some(id) => Some(id),
        None => match state.kernel.store.find_call_log_by_sid(&body.call_sid).await {
            Ok(log) => log.map(|l| l.id),
            Err(e) => {
                warn!(sid = %body.call_sid, error = %e, "sid lookup failed");
                None
            }
        },
    };
    let Some(call_log_id) = call_log_id else {
        warn!(sid = %body.call_sid, "webhook with no resolvable call log");
        return StatusCode::OK.into_response();
    };

    let update = CallStatusUpdate {
        status,
        duration_secs: body.duration_secs,
        recording_url: body.recording_url,
    };
    match finalize_call(&state.kernel, call_log_id, update).await {
        Ok(FinalizeOutcome::Applied) => {
            debug!(call_log_id = %call_log_id, sid = %body.call_sid, "webhook applied");
        }
        Ok(outcome) => {
            debug!(call_log_id = %call_log_id, ?outcome, "webhook absorbed");
        }
        Err(e) => {
            // Let the carrier redeliver; finalize is idempotent.
            warn!(call_log_id = %call_log_id, error = %e, "webhook finalize failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    StatusCode::OK.into_response()
}
