//! Campaign lifecycle routes. Thin adapters over [`CampaignApi`]; CRUD
//! beyond lifecycle lives elsewhere.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::common::{CampaignId, UserId};
use crate::domains::campaigns::api::CampaignApiError;
use crate::domains::campaigns::models::NewContact;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ActorBody {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct AddContactsBody {
    pub user_id: UserId,
    pub contacts: Vec<ContactBody>,
}

#[derive(Debug, Deserialize)]
pub struct ContactBody {
    pub phone_number: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub custom_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(err: CampaignApiError) -> Response {
    let status = match &err {
        CampaignApiError::NotFound => StatusCode::NOT_FOUND,
        CampaignApiError::Forbidden => StatusCode::FORBIDDEN,
        CampaignApiError::AlreadyActive
        | CampaignApiError::NotStartable(_)
        | CampaignApiError::NotActive
        | CampaignApiError::NotPaused
        | CampaignApiError::NotCancellable(_) => StatusCode::CONFLICT,
        CampaignApiError::NoContacts => StatusCode::UNPROCESSABLE_ENTITY,
        CampaignApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "campaign api error");
    }
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

pub async fn start(
    State(state): State<AppState>,
    Path(campaign_id): Path<CampaignId>,
    Json(body): Json<ActorBody>,
) -> Response {
    match state.api.start(campaign_id, body.user_id).await {
        Ok(report) => Json(serde_json::json!({ "enqueued": report.enqueued })).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn pause(
    State(state): State<AppState>,
    Path(campaign_id): Path<CampaignId>,
    Json(body): Json<ActorBody>,
) -> Response {
    match state.api.pause(campaign_id, body.user_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn resume(
    State(state): State<AppState>,
    Path(campaign_id): Path<CampaignId>,
    Json(body): Json<ActorBody>,
) -> Response {
    match state.api.resume(campaign_id, body.user_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(campaign_id): Path<CampaignId>,
    Json(body): Json<ActorBody>,
) -> Response {
    match state.api.cancel(campaign_id, body.user_id).await {
        Ok(report) => Json(serde_json::json!({
            "jobs_removed": report.jobs_removed,
            "contacts_skipped": report.contacts_skipped,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn add_contacts(
    State(state): State<AppState>,
    Path(campaign_id): Path<CampaignId>,
    Json(body): Json<AddContactsBody>,
) -> Response {
    let contacts: Vec<NewContact> = body
        .contacts
        .into_iter()
        .map(|c| NewContact {
            phone_number: c.phone_number,
            priority: c.priority,
            custom_data: c.custom_data,
        })
        .collect();

    match state
        .api
        .add_contacts(campaign_id, body.user_id, contacts)
        .await
    {
        Ok(report) => Json(serde_json::json!({
            "inserted": report.inserted,
            "rejected": report.rejected,
            "enqueued": report.enqueued,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn retry_failed(
    State(state): State<AppState>,
    Path(campaign_id): Path<CampaignId>,
    Json(body): Json<ActorBody>,
) -> Response {
    match state.api.retry_failed(campaign_id, body.user_id).await {
        Ok(report) => Json(serde_json::json!({
            "enqueued": report.enqueued,
            "refused": report.refused,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}
