//! Per-user exclusive locks.
//!
//! `RocksDB` gives atomic writes (via `WriteBatch`) but no row locking, so
//! balance operations serialize through an in-process async mutex per user.
//! Acquisition is bounded: a holder stuck past the timeout surfaces as
//! `StoreError::LockTimeout` instead of wedging every caller behind it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use arbor_credits_core::UserId;

use crate::error::{Result, StoreError};

/// Guard granting exclusive access to one user's balance rows.
///
/// Dropping the guard releases the lock.
pub type UserLockGuard = OwnedMutexGuard<()>;

/// Registry of per-user mutexes.
///
/// Entries are created on first use and pruned opportunistically once no
/// task holds or waits on them, so the map does not grow with the user
/// population.
#[derive(Default)]
pub struct UserLocks {
    entries: StdMutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    /// Create an empty lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a user, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if the lock is still held when the
    /// timeout elapses.
    pub async fn acquire(&self, user_id: &UserId, timeout: Duration) -> Result<UserLockGuard> {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            // Any task holding or awaiting a lock owns its own Arc clone, so
            // a strong count of one means the entry is idle.
            entries.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(entries.entry(*user_id).or_default())
        };

        tokio::time::timeout(timeout, entry.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout { user_id: *user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn same_user_serializes() {
        let locks = UserLocks::new();
        let user_id = UserId::generate();

        let guard = locks.acquire(&user_id, LONG).await.unwrap();

        let contended = locks.acquire(&user_id, SHORT).await;
        assert!(matches!(
            contended,
            Err(StoreError::LockTimeout { user_id: blocked }) if blocked == user_id
        ));

        drop(guard);
        locks.acquire(&user_id, SHORT).await.unwrap();
    }

    #[tokio::test]
    async fn different_users_are_independent() {
        let locks = UserLocks::new();
        let first = UserId::generate();
        let second = UserId::generate();

        let _guard = locks.acquire(&first, LONG).await.unwrap();
        locks.acquire(&second, SHORT).await.unwrap();
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = UserLocks::new();
        let user_id = UserId::generate();

        drop(locks.acquire(&user_id, LONG).await.unwrap());

        // The next acquisition (any user) prunes the idle entry.
        let other = UserId::generate();
        let _guard = locks.acquire(&other, LONG).await.unwrap();

        let entries = locks.entries.lock().unwrap();
        assert!(!entries.contains_key(&user_id));
    }
}
