//! Error types for arbor-credits storage.

use arbor_credits_core::UserId;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record looked up (e.g. `user`, `account`, `generation`).
        entity: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// A user record already exists for this ID.
    #[error("user already registered: {user_id}")]
    AlreadyRegistered {
        /// The user that attempted to register twice.
        user_id: UserId,
    },

    /// No entitlement covers the request: no active subscription, no
    /// trial generations, no token balance.
    #[error("insufficient credits: trial_remaining={trial_remaining}, token_balance={token_balance}")]
    InsufficientCredits {
        /// Trial generations left at denial time.
        trial_remaining: u32,
        /// Token balance at denial time.
        token_balance: i64,
    },

    /// Provider payment already credited (idempotency check failed).
    #[error("duplicate payment: {external_payment_id}")]
    DuplicatePayment {
        /// The provider payment ID that was duplicated.
        external_payment_id: String,
    },

    /// Could not acquire the per-user lock within the timeout.
    #[error("lock timeout for user {user_id}")]
    LockTimeout {
        /// The user whose lock was contended.
        user_id: UserId,
    },
}
