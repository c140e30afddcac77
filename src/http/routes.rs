//! HTTP routes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderName;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use super::gate::{Caller, RequestGate};
use crate::error::Result;
use crate::ratelimit::QuotaStatus;

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Build the service router.
pub fn router(gate: Arc<RequestGate>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/beta", get(beta))
        .route("/status", get(status))
        .with_state(gate)
}

/// Rate limited endpoint reporting the caller's remaining quota.
async fn ping(State(gate): State<Arc<RequestGate>>, Caller(identity): Caller) -> Result<Response> {
    let admission = gate.admit(&identity).await?;

    Ok((
        [
            (LIMIT_HEADER, admission.limit.to_string()),
            (REMAINING_HEADER, admission.remaining.to_string()),
            (RESET_HEADER, admission.reset_after.as_secs().to_string()),
        ],
        Json(json!({ "remaining": admission.remaining })),
    )
        .into_response())
}

/// Unlimited endpoint with a fixed payload.
async fn beta() -> Json<serde_json::Value> {
    Json(json!({ "message": "This is beta endpoint" }))
}

#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    identity: &'a str,
    #[serde(flatten)]
    quota: QuotaStatus,
}

/// Current threshold and remaining quota, without counting the call.
async fn status(State(gate): State<Arc<RequestGate>>, Caller(identity): Caller) -> Result<Response> {
    let quota = gate.status(&identity).await?;

    Ok(Json(StatusBody {
        identity: identity.as_str(),
        quota,
    })
    .into_response())
}
