//! `RocksDB` storage layer for arbor-credits.
//!
//! This crate provides persistent storage for users, token accounts, the
//! ledger, generations, and rate-limit records using `RocksDB` with column
//! families for efficient indexing. Compound balance operations (deduct,
//! refund, purchase crediting) live in [`ledger`] and combine a per-user
//! lock with atomic `WriteBatch` commits.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `users`: User records (trial counters, subscription), keyed by `user_id`
//! - `accounts`: Token account records, keyed by `user_id`
//! - `transactions`: Ledger transactions, keyed by `transaction_id` (ULID)
//! - `transactions_by_user`: Index for listing transactions by user
//! - `payments`: Processed provider payments for idempotency
//! - `generations`: Generation records, keyed by `generation_id`
//! - `rate_limit`: Request-attempt records, keyed by `user_id || entry_ulid`
//!
//! # Example
//!
//! ```no_run
//! use arbor_credits_store::{RocksStore, Store};
//! use arbor_credits_core::{TokenAccount, User, UserId};
//!
//! let store = RocksStore::open("/tmp/arbor-credits-db").unwrap();
//!
//! // Create a user with a token account
//! let user_id = UserId::generate();
//! store.put_user(&User::new(user_id, 3)).unwrap();
//! store.put_account(&TokenAccount::new(user_id)).unwrap();
//!
//! // Get balances
//! let account = store.get_account(&user_id).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod ledger;
pub mod locks;
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use ledger::RateLimitDecision;
pub use locks::{UserLockGuard, UserLocks};
pub use rocks::RocksStore;

use arbor_credits_core::{
    Generation, GenerationId, TokenAccount, TokenTransaction, TransactionId, User, UserId,
};

/// The storage trait defining plain record operations.
///
/// This trait abstracts single-record reads and writes, allowing for
/// different implementations (e.g., `RocksDB`, in-memory for testing).
/// Balance-changing operations are deliberately *not* here: they must go
/// through the [`ledger`] operations, which serialize per user.
pub trait Store: Send + Sync {
    // =========================================================================
    // User Operations
    // =========================================================================

    /// Insert or update a user record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_user(&self, user: &User) -> Result<()>;

    /// Get a user by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_user(&self, user_id: &UserId) -> Result<Option<User>>;

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Insert or update a token account record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_account(&self, account: &TokenAccount) -> Result<()>;

    /// Get a token account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_account(&self, user_id: &UserId) -> Result<Option<TokenAccount>>;

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// Insert a ledger transaction.
    ///
    /// This also maintains the user index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_transaction(&self, transaction: &TokenTransaction) -> Result<()>;

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<TokenTransaction>>;

    /// List transactions for a user, ordered by time (newest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenTransaction>>;

    // =========================================================================
    // Payment Operations (for idempotency)
    // =========================================================================

    /// Check if a provider payment has already been credited.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn has_payment(&self, external_payment_id: &str) -> Result<bool>;

    // =========================================================================
    // Generation Operations
    // =========================================================================

    /// Insert or update a generation record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_generation(&self, generation: &Generation) -> Result<()>;

    /// Get a generation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_generation(&self, generation_id: &GenerationId) -> Result<Option<Generation>>;
}
