//! Submission handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::AppState;
use duet_core::ingest::{Disposition, RejectReason, Rejection, Submission, SubmissionOutcome};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub transaction_id: i64,
    pub disposition: Disposition,
}

/// HTTP status for a rejection reason
pub fn rejection_status(reason: RejectReason) -> StatusCode {
    match reason {
        RejectReason::MissingFields
        | RejectReason::InvalidChannel
        | RejectReason::UnparseableAmount
        | RejectReason::UnparseableMerchant => StatusCode::BAD_REQUEST,
        RejectReason::Duplicate => StatusCode::CONFLICT,
        RejectReason::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection_response(rejection: Rejection) -> Response {
    let status = rejection_status(rejection.reason);
    let retry_after = rejection.retry_after_secs;
    let mut response = (status, Json(rejection)).into_response();

    if let Some(secs) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

/// POST /api/submissions - Ingest a fast- or slow-channel notification
///
/// Accepted submissions answer 202; enrichment happens in the background.
/// A body that is not JSON is rejected with the same reason-coded shape as
/// any other rejection.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Submission>, JsonRejection>,
) -> Response {
    let submission = match body {
        Ok(Json(submission)) => submission,
        Err(e) => return rejection_response(Rejection::malformed_body(e.body_text())),
    };

    match state.ingestor.submit(&submission) {
        SubmissionOutcome::Accepted {
            transaction_id,
            disposition,
        } => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                transaction_id,
                disposition,
            }),
        )
            .into_response(),
        SubmissionOutcome::Rejected(rejection) => rejection_response(rejection),
    }
}
