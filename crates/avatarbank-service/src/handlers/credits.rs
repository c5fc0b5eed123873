//! Credit balance and transaction handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Serialize;

use avatarbank_core::CreditTransaction;

use super::{paginate, PageQuery};
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Balance in credits.
    pub credit_balance: i64,
    /// Credits the user may spend now (zero unless active).
    pub spendable_credits: i64,
    /// Account status.
    pub status: String,
}

/// Get current credit balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user = state
        .store
        .get_user(&auth.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(BalanceResponse {
        credit_balance: user.credit_balance,
        spendable_credits: user.spendable_credits(),
        status: user.status.to_string(),
    }))
}

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Transaction type.
    pub transaction_type: String,
    /// Signed amount (positive = credit, negative = debit).
    pub amount: i64,
    /// Balance before this transaction.
    pub credit_before: i64,
    /// Balance after this transaction.
    pub credit_after: i64,
    /// Generation ID or payout reference.
    pub reference_id: Option<String>,
    /// Description.
    pub description: String,
    /// Timestamp.
    pub created_at: String,
}

impl From<&CreditTransaction> for TransactionResponse {
    fn from(tx: &CreditTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            transaction_type: tx.transaction_type.as_str().to_string(),
            amount: tx.amount,
            credit_before: tx.credit_before,
            credit_after: tx.credit_after,
            reference_id: tx.reference_id.clone(),
            description: tx.description.clone(),
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<TransactionResponse>,
    /// Whether there are more transactions.
    pub has_more: bool,
}

/// List transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    state
        .store
        .get_user(&auth.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    // Fetch one more than requested to determine has_more
    let limit = query.limit();
    let transactions = state
        .store
        .list_transactions_by_user(&auth.user_id, limit + 1, query.offset)
        .await?;

    let (transactions, has_more) = paginate(transactions, limit);

    Ok(Json(ListTransactionsResponse {
        transactions: transactions.iter().map(TransactionResponse::from).collect(),
        has_more,
    }))
}
