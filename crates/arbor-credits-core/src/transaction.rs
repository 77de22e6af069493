//! Token ledger transactions for arbor-credits.
//!
//! Every change to a token balance appends a ledger row. The ledger is
//! append-only and doubles as the idempotency index for payment webhooks:
//! `external_payment_id` is unique when present.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GenerationId, TransactionId, UserId};

/// A token ledger transaction representing a balance change.
///
/// Transactions use ULIDs for time-ordered IDs and are immutable once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Token amount. Positive = credit, negative = debit.
    pub amount: i64,

    /// Type of transaction.
    pub transaction_type: TransactionType,

    /// Balance after this transaction.
    pub balance_after: i64,

    /// Provider payment reference. Set for purchases only; unique across
    /// the ledger when present.
    pub external_payment_id: Option<String>,

    /// The generation this spend or refund belongs to, if any.
    pub generation_id: Option<GenerationId>,

    /// Human-readable description.
    pub description: String,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl TokenTransaction {
    /// Create a new purchase transaction.
    #[must_use]
    pub fn purchase(
        user_id: UserId,
        amount: i64,
        balance_after: i64,
        external_payment_id: String,
        description: String,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount,
            transaction_type: TransactionType::Purchase,
            balance_after,
            external_payment_id: Some(external_payment_id),
            generation_id: None,
            description,
            created_at: Utc::now(),
        }
    }

    /// Create a manual grant transaction (admin or promotional credit).
    ///
    /// Grants are purchase-type rows with no provider payment reference.
    #[must_use]
    pub fn grant(user_id: UserId, amount: i64, balance_after: i64, description: String) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount,
            transaction_type: TransactionType::Purchase,
            balance_after,
            external_payment_id: None,
            generation_id: None,
            description,
            created_at: Utc::now(),
        }
    }

    /// Create a new generation transaction (deduction).
    #[must_use]
    pub fn generation(
        user_id: UserId,
        amount: i64,
        balance_after: i64,
        generation_id: GenerationId,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount: -amount.abs(), // Always negative for spends
            transaction_type: TransactionType::Generation,
            balance_after,
            external_payment_id: None,
            generation_id: Some(generation_id),
            description: format!("Generation {generation_id}"),
            created_at: Utc::now(),
        }
    }

    /// Create a new refund transaction reversing a generation spend.
    #[must_use]
    pub fn refund(
        user_id: UserId,
        amount: i64,
        balance_after: i64,
        generation_id: GenerationId,
        reason: String,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount: amount.abs(),
            transaction_type: TransactionType::Refund,
            balance_after,
            external_payment_id: None,
            generation_id: Some(generation_id),
            description: reason,
            created_at: Utc::now(),
        }
    }
}

/// Type of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// User purchased tokens.
    Purchase,

    /// Token deducted for a generation.
    Generation,

    /// Refund reversing a generation deduction.
    Refund,
}

impl TransactionType {
    /// Check if this transaction type adds tokens.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        matches!(self, Self::Purchase | Self::Refund)
    }

    /// Check if this transaction type removes tokens.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        matches!(self, Self::Generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purchase_transaction_carries_payment_id() {
        let user_id = UserId::generate();
        let tx = TokenTransaction::purchase(
            user_id,
            10,
            10,
            "pay_123".into(),
            "10-token pack".into(),
        );

        assert_eq!(tx.amount, 10);
        assert_eq!(tx.transaction_type, TransactionType::Purchase);
        assert_eq!(tx.external_payment_id.as_deref(), Some("pay_123"));
        assert!(tx.generation_id.is_none());
    }

    #[test]
    fn grant_transaction_has_no_payment_id() {
        let tx = TokenTransaction::grant(UserId::generate(), 5, 5, "launch promo".into());

        assert_eq!(tx.amount, 5);
        assert_eq!(tx.transaction_type, TransactionType::Purchase);
        assert!(tx.external_payment_id.is_none());
        assert!(tx.generation_id.is_none());
    }

    #[test]
    fn generation_transaction_is_negative() {
        let user_id = UserId::generate();
        let generation_id = GenerationId::generate();
        let tx = TokenTransaction::generation(user_id, 1, 4, generation_id);

        assert_eq!(tx.amount, -1);
        assert_eq!(tx.transaction_type, TransactionType::Generation);
        assert_eq!(tx.generation_id, Some(generation_id));
        assert!(tx.external_payment_id.is_none());
    }

    #[test]
    fn refund_transaction_is_positive() {
        let user_id = UserId::generate();
        let generation_id = GenerationId::generate();
        let tx =
            TokenTransaction::refund(user_id, 1, 5, generation_id, "generation failed".into());

        assert_eq!(tx.amount, 1);
        assert_eq!(tx.transaction_type, TransactionType::Refund);
        assert_eq!(tx.generation_id, Some(generation_id));
    }

    #[test]
    fn transaction_type_is_credit_debit() {
        assert!(TransactionType::Purchase.is_credit());
        assert!(TransactionType::Refund.is_credit());
        assert!(!TransactionType::Generation.is_credit());

        assert!(TransactionType::Generation.is_debit());
        assert!(!TransactionType::Purchase.is_debit());
    }
}
