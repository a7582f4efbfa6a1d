//! Enrichment job handlers

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::{AppError, AppState, MAX_PAGE_LIMIT};
use duet_core::models::{EnrichmentJob, JobStatus};

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    /// queued, running, succeeded or failed
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// GET /api/jobs - List enrichment jobs, e.g. `?status=failed`
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<JobQuery>,
) -> Result<Json<Vec<EnrichmentJob>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| AppError::bad_request(&e))?;

    let limit = params.limit.clamp(1, MAX_PAGE_LIMIT);
    Ok(Json(state.db.list_jobs(status, limit)?))
}
