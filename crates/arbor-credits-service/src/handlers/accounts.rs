//! Account registration and profile handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use arbor_credits_core::{Subscription, TokenAccount, User};
use arbor_credits_store::Store;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Account response.
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    /// User ID.
    pub user_id: String,
    /// Trial generations still available.
    pub trial_remaining: u32,
    /// Trial generations consumed so far.
    pub trial_used: u32,
    /// Purchased-token balance.
    pub token_balance: i64,
    /// Whether the user currently has an active subscription.
    pub subscription_active: bool,
    /// Subscription details, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionResponse>,
    /// Created timestamp.
    pub created_at: String,
}

/// Subscription snapshot in API responses.
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    /// Subscription tier.
    pub tier: String,
    /// Provider-reported status.
    pub status: String,
    /// End of the current billing period.
    pub current_period_end: String,
    /// Whether the subscription lapses at period end.
    pub cancel_at_period_end: bool,
}

impl From<&Subscription> for SubscriptionResponse {
    fn from(sub: &Subscription) -> Self {
        Self {
            tier: sub.tier.as_str().to_string(),
            status: sub.status.as_str().to_string(),
            current_period_end: sub.current_period_end.to_rfc3339(),
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }
}

fn account_response(user: &User, account: &TokenAccount) -> AccountResponse {
    AccountResponse {
        user_id: user.user_id.to_string(),
        trial_remaining: user.trial_remaining,
        trial_used: user.trial_used,
        token_balance: account.balance,
        subscription_active: user.has_active_subscription(Utc::now()),
        subscription: user.subscription.as_ref().map(SubscriptionResponse::from),
        created_at: user.created_at.to_rfc3339(),
    }
}

/// Register a new account.
///
/// Creates the user record and token account together, seeding the trial
/// allowance from configuration.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<AccountResponse>, ApiError> {
    let (user, account) = state
        .store
        .register_user(&auth.user_id, state.config.trial_credits)
        .await?;

    tracing::info!(
        user_id = %auth.user_id,
        trial_credits = %state.config.trial_credits,
        "Account registered"
    );

    Ok(Json(account_response(&user, &account)))
}

/// Get the current user's account.
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<AccountResponse>, ApiError> {
    let user = state
        .store
        .get_user(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;
    let account = state
        .store
        .get_account(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(account_response(&user, &account)))
}
