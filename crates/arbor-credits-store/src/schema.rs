//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// User records (trial counters, subscription), keyed by `user_id`.
    pub const USERS: &str = "users";

    /// Token account records, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Token ledger transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Processed provider payments for idempotency, keyed by
    /// `external_payment_id`. Value is the crediting transaction ID.
    pub const PAYMENTS: &str = "payments";

    /// Generation records, keyed by `generation_id`.
    pub const GENERATIONS: &str = "generations";

    /// Rate-limit attempt records, keyed by `user_id || entry_ulid`.
    pub const RATE_LIMIT: &str = "rate_limit";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::USERS,
        cf::ACCOUNTS,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::PAYMENTS,
        cf::GENERATIONS,
        cf::RATE_LIMIT,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_column_families_are_unique() {
        let families = all_column_families();
        for (i, name) in families.iter().enumerate() {
            assert!(!families[i + 1..].contains(name), "duplicate: {name}");
        }
    }
}
