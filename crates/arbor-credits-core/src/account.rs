//! Token account types for arbor-credits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// The purchased-token balance for a user.
///
/// One-to-one with [`crate::User`] and created in the same transaction.
/// Invariant: `balance == total_purchased - total_consumed`, and balance
/// never goes negative. Refunds reduce `total_consumed` rather than
/// inflating `total_purchased`, so the lifetime counters stay honest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenAccount {
    /// The owning user.
    pub user_id: UserId,

    /// Tokens currently available to spend.
    pub balance: i64,

    /// Lifetime tokens purchased.
    pub total_purchased: i64,

    /// Lifetime tokens consumed (net of refunds).
    pub total_consumed: i64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl TokenAccount {
    /// Create a new account with zero balance.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            balance: 0,
            total_purchased: 0,
            total_consumed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether the account has at least one token to spend.
    #[must_use]
    pub const fn has_tokens(&self) -> bool {
        self.balance > 0
    }
}
