//! Transaction handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppState, MAX_PAGE_LIMIT};
use duet_core::models::{AbsorbedSubmission, Merchant, Transaction, TransactionMetadata};

/// Query parameters for listing transactions
#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Only this user's transactions
    pub user_id: Option<String>,
}

fn default_limit() -> i64 {
    50
}

#[derive(Serialize)]
pub struct TransactionResponse {
    pub transactions: Vec<Transaction>,
    pub total: i64,
    pub limit: i64,
}

/// A transaction with its match state and merchant
#[derive(Serialize)]
pub struct TransactionDetail {
    pub transaction: Transaction,
    pub metadata: Option<TransactionMetadata>,
    pub merchant: Option<Merchant>,
    /// Matched submissions merged into this record
    pub absorbed: Vec<AbsorbedSubmission>,
}

/// GET /api/transactions - List recent transactions
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TransactionQuery>,
) -> Result<Json<TransactionResponse>, AppError> {
    // Input validation: clamp pagination parameters
    let limit = params.limit.clamp(1, MAX_PAGE_LIMIT);

    let transactions = state
        .db
        .list_transactions(params.user_id.as_deref(), limit)?;
    let total = state.db.count_transactions()?;

    Ok(Json(TransactionResponse {
        transactions,
        total,
        limit,
    }))
}

/// GET /api/transactions/:id - Get a single transaction
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TransactionDetail>, AppError> {
    let transaction = state
        .db
        .get_transaction(id)?
        .ok_or_else(|| AppError::not_found(&format!("Transaction {} not found", id)))?;

    let metadata = state.db.get_metadata(id)?;
    let merchant = state.db.get_merchant(transaction.merchant_id)?;
    let absorbed = state.db.list_absorbed_submissions(id)?;

    Ok(Json(TransactionDetail {
        transaction,
        metadata,
        merchant,
        absorbed,
    }))
}
