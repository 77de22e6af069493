//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use ulid::Ulid;

use arbor_credits_core::{GenerationId, TransactionId, UserId};

/// Create a user key from a user ID.
#[must_use]
pub fn user_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create an account key from a user ID.
#[must_use]
pub fn account_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a user-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`
///
/// Since ULIDs are time-ordered, transactions for a user will be sorted by time.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Create a prefix for iterating all transactions for a user.
#[must_use]
pub fn user_transactions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the transaction ID from a user-transaction index key.
///
/// # Panics
///
/// Panics if the key is not at least 32 bytes.
#[must_use]
pub fn extract_transaction_id_from_user_key(key: &[u8]) -> TransactionId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    TransactionId::from_bytes(bytes).expect("valid ULID bytes")
}

/// Create a payment key from a provider payment ID.
#[must_use]
pub fn payment_key(external_payment_id: &str) -> Vec<u8> {
    external_payment_id.as_bytes().to_vec()
}

/// Create a generation key from a generation ID.
#[must_use]
pub fn generation_key(generation_id: &GenerationId) -> Vec<u8> {
    generation_id.as_bytes().to_vec()
}

/// Create a rate-limit record key.
///
/// Format: `user_id (16 bytes) || entry_ulid (16 bytes)`
///
/// The entry ULID carries the attempt timestamp, so records for a user
/// iterate oldest first.
#[must_use]
pub fn rate_limit_key(user_id: &UserId, entry: &Ulid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&entry.to_bytes());
    key
}

/// Create a prefix for iterating all rate-limit records for a user.
#[must_use]
pub fn rate_limit_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the attempt timestamp (milliseconds since epoch) from a
/// rate-limit record key.
///
/// # Panics
///
/// Panics if the key is not at least 32 bytes.
#[must_use]
pub fn rate_limit_timestamp_ms(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    Ulid::from_bytes(bytes).timestamp_ms()
}
