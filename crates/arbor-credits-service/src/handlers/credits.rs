//! Credit balance, transaction history, and grant handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use arbor_credits_core::{TokenTransaction, UserId};
use arbor_credits_store::Store;

use crate::auth::{AdminAuth, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Trial generations still available.
    pub trial_remaining: u32,
    /// Purchased-token balance.
    pub token_balance: i64,
    /// Whether a subscription currently covers generations.
    pub subscription_active: bool,
}

/// Get current balances across all entitlement sources.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user = state
        .store
        .get_user(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;
    let account = state
        .store
        .get_account(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(BalanceResponse {
        trial_remaining: user.trial_remaining,
        token_balance: account.balance,
        subscription_active: user.has_active_subscription(Utc::now()),
    }))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Maximum number of transactions to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Token delta (positive = credit, negative = debit).
    pub amount: i64,
    /// Transaction type.
    pub transaction_type: String,
    /// Balance after this transaction.
    pub balance_after: i64,
    /// Description.
    pub description: String,
    /// Timestamp.
    pub created_at: String,
}

impl From<&TokenTransaction> for TransactionResponse {
    fn from(tx: &TokenTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            amount: tx.amount,
            transaction_type: format!("{:?}", tx.transaction_type).to_lowercase(),
            balance_after: tx.balance_after,
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

/// List token transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    // Verify account exists
    state
        .store
        .get_account(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    // Fetch one more than requested to determine has_more
    let limit = query.limit.min(100);
    let transactions =
        state
            .store
            .list_transactions_by_user(&auth.user_id, limit + 1, query.offset)?;

    let has_more = transactions.len() > limit;
    let transactions: Vec<_> = transactions
        .iter()
        .take(limit)
        .map(TransactionResponse::from)
        .collect();

    Ok(Json(ListTransactionsResponse {
        transactions,
        has_more,
    }))
}

/// Manual grant request (admin only).
#[derive(Debug, Deserialize)]
pub struct GrantTokensRequest {
    /// User to credit.
    pub user_id: String,
    /// Tokens to grant (must be positive).
    pub amount: i64,
    /// Why the grant was made (goes into the ledger description).
    pub reason: String,
}

/// Manual grant response.
#[derive(Debug, Serialize)]
pub struct GrantTokensResponse {
    /// New token balance.
    pub token_balance: i64,
    /// The crediting transaction ID.
    pub transaction_id: String,
}

/// Grant tokens to a user (admin only).
pub async fn grant_tokens(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<GrantTokensRequest>,
) -> Result<Json<GrantTokensResponse>, ApiError> {
    if body.amount <= 0 {
        return Err(ApiError::BadRequest("Grant amount must be positive".into()));
    }

    let user_id = body
        .user_id
        .parse::<UserId>()
        .map_err(|_| ApiError::BadRequest("Invalid user ID".into()))?;

    let tx = state
        .store
        .grant_tokens(
            &user_id,
            body.amount,
            format!("Manual grant by {}: {}", admin.admin_id, body.reason),
        )
        .await?;

    tracing::info!(
        user_id = %user_id,
        amount = %body.amount,
        admin_id = %admin.admin_id,
        "Tokens granted"
    );

    Ok(Json(GrantTokensResponse {
        token_balance: tx.balance_after,
        transaction_id: tx.id.to_string(),
    }))
}
