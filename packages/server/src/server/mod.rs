//! HTTP surface: campaign lifecycle routes, the carrier webhook, and a
//! health probe. Handlers stay thin; the dispatch engine does the work.

pub mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::domains::campaigns::CampaignApi;
use crate::kernel::DialerKernel;

use routes::AppState;

pub fn build_app(kernel: Arc<DialerKernel>) -> Router {
    let state = AppState {
        api: Arc::new(CampaignApi::new(kernel.clone())),
        kernel,
    };

    Router::new()
        .route("/health", get(health))
        .route("/campaigns/:id/start", post(routes::campaigns::start))
        .route("/campaigns/:id/pause", post(routes::campaigns::pause))
        .route("/campaigns/:id/resume", post(routes::campaigns::resume))
        .route("/campaigns/:id/cancel", post(routes::campaigns::cancel))
        .route(
            "/campaigns/:id/contacts",
            post(routes::campaigns::add_contacts),
        )
        .route(
            "/campaigns/:id/retry-failed",
            post(routes::campaigns::retry_failed),
        )
        .route("/webhooks/call-status", post(routes::webhooks::call_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
