//! Health check handler

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{AppError, AppState};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub transactions: i64,
    pub unprocessed: i64,
    /// Job counts keyed by status
    pub jobs: BTreeMap<String, i64>,
}

/// GET /api/health - Liveness plus queue depth
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, AppError> {
    let (processed, unprocessed) = state.db.count_processed()?;
    let jobs = state
        .db
        .count_jobs_by_status()?
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();

    Ok(Json(HealthResponse {
        status: "ok",
        transactions: processed + unprocessed,
        unprocessed,
        jobs,
    }))
}
