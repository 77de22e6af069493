//! Compound balance operations.
//!
//! Every operation here acquires the owning user's exclusive lock, re-reads
//! state under it, and commits all mutations in a single `WriteBatch`. That
//! combination is what the entitlement guarantees rest on: deductions and
//! refunds for one user are totally ordered, and a crash between check and
//! commit leaves no partial state behind.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, WriteBatch};
use ulid::Ulid;

use arbor_credits_core::{
    resolve_entitlement, Generation, GenerationId, GenerationOutcome, GenerationRequest,
    GenerationStatus, PaymentMethod, RateLimitRecord, Subscription, TokenAccount,
    TokenTransaction, User, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::cf;
use crate::{RocksStore, Store};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,

    /// Seconds until the oldest in-window attempt ages out. Zero when
    /// allowed; always at least one when denied.
    pub retry_after_seconds: u64,
}

/// Milliseconds since the epoch; the clock is assumed post-1970.
#[allow(clippy::cast_sign_loss)]
fn now_unix_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

impl RocksStore {
    /// Create a user and their token account in one atomic write.
    ///
    /// # Errors
    ///
    /// - `StoreError::AlreadyRegistered` if the user exists.
    /// - `StoreError::LockTimeout` if the user lock is contended past the
    ///   timeout.
    pub async fn register_user(
        &self,
        user_id: &UserId,
        trial_credits: u32,
    ) -> Result<(User, TokenAccount)> {
        let _guard = self.locks.acquire(user_id, self.lock_timeout).await?;

        if self.get_user(user_id)?.is_some() {
            return Err(StoreError::AlreadyRegistered { user_id: *user_id });
        }

        let user = User::new(*user_id, trial_credits);
        let account = TokenAccount::new(*user_id);

        let cf_users = self.cf(cf::USERS)?;
        let cf_accounts = self.cf(cf::ACCOUNTS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_users, keys::user_key(user_id), Self::serialize(&user)?);
        batch.put_cf(
            &cf_accounts,
            keys::account_key(user_id),
            Self::serialize(&account)?,
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(user_id = %user_id, trial_credits, "user registered");

        Ok((user, account))
    }

    /// Authorize one generation, consuming a unit of entitlement.
    ///
    /// The payment method is resolved under the user lock in strict
    /// priority order (subscription, trial, tokens), so a concurrent
    /// deduction cannot spend the same unit twice. Subscription-covered
    /// generations consume nothing; token deductions append a ledger row
    /// in the same batch as the balance change and the generation record.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user or account is missing.
    /// - `StoreError::InsufficientCredits` if no entitlement covers the
    ///   request.
    /// - `StoreError::LockTimeout` on lock contention past the timeout.
    pub async fn deduct(&self, user_id: &UserId, request: GenerationRequest) -> Result<Generation> {
        let _guard = self.locks.acquire(user_id, self.lock_timeout).await?;

        let mut user = self.get_user(user_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "user",
            id: user_id.to_string(),
        })?;
        let mut account = self
            .get_account(user_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "account",
                id: user_id.to_string(),
            })?;

        let now = Utc::now();
        let method = resolve_entitlement(&user, &account, now).ok_or(
            StoreError::InsufficientCredits {
                trial_remaining: user.trial_remaining,
                token_balance: account.balance,
            },
        )?;

        let generation = Generation::new(*user_id, request, method);

        let cf_users = self.cf(cf::USERS)?;
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let cf_generations = self.cf(cf::GENERATIONS)?;

        let mut batch = WriteBatch::default();
        match method {
            PaymentMethod::Subscription => {
                // Unlimited while active; nothing consumed.
            }
            PaymentMethod::Trial => {
                user.trial_remaining -= 1;
                user.trial_used += 1;
                user.updated_at = now;
                batch.put_cf(&cf_users, keys::user_key(user_id), Self::serialize(&user)?);
            }
            PaymentMethod::Token => {
                account.balance -= 1;
                account.total_consumed += 1;
                account.updated_at = now;
                let tx = TokenTransaction::generation(*user_id, 1, account.balance, generation.id);
                batch.put_cf(
                    &cf_accounts,
                    keys::account_key(user_id),
                    Self::serialize(&account)?,
                );
                batch.put_cf(&cf_tx, keys::transaction_key(&tx.id), Self::serialize(&tx)?);
                batch.put_cf(&cf_tx_by_user, keys::user_transaction_key(user_id, &tx.id), []);
            }
        }
        batch.put_cf(
            &cf_generations,
            keys::generation_key(&generation.id),
            Self::serialize(&generation)?,
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(
            user_id = %user_id,
            generation_id = %generation.id,
            payment_method = method.as_str(),
            "entitlement consumed"
        );

        Ok(generation)
    }

    /// Restore the unit consumed by a generation.
    ///
    /// Returns `true` if a unit was restored, `false` if there was nothing
    /// to restore (already refunded, or subscription-covered). Repeat calls
    /// are no-ops: `credit_refunded` flips at most once per generation.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the generation is missing.
    /// - `StoreError::LockTimeout` on lock contention past the timeout.
    pub async fn refund(&self, generation_id: &GenerationId, reason: &str) -> Result<bool> {
        // The pre-lock read only discovers the owner; all state is re-read
        // under the lock.
        let probe = self.load_generation(generation_id)?;
        let _guard = self.locks.acquire(&probe.user_id, self.lock_timeout).await?;

        let mut generation = self.load_generation(generation_id)?;
        let now = Utc::now();

        let mut batch = WriteBatch::default();
        if !self.stage_refund(&mut batch, &mut generation, reason, now)? {
            return Ok(false);
        }

        let cf_generations = self.cf(cf::GENERATIONS)?;
        batch.put_cf(
            &cf_generations,
            keys::generation_key(generation_id),
            Self::serialize(&generation)?,
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::info!(
            user_id = %generation.user_id,
            generation_id = %generation_id,
            payment_method = generation.payment_method.as_str(),
            reason,
            "credit refunded"
        );

        Ok(true)
    }

    /// Record the worker's terminal outcome for a generation.
    ///
    /// Failure refunds the consumed unit in the same batch as the status
    /// change, so a crash cannot strand a failed generation unrefunded.
    /// A generation already in a terminal state is returned unchanged
    /// (worker callbacks are delivered at least once).
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the generation is missing.
    /// - `StoreError::LockTimeout` on lock contention past the timeout.
    pub async fn record_result(
        &self,
        generation_id: &GenerationId,
        outcome: GenerationOutcome,
    ) -> Result<Generation> {
        let probe = self.load_generation(generation_id)?;
        let _guard = self.locks.acquire(&probe.user_id, self.lock_timeout).await?;

        let mut generation = self.load_generation(generation_id)?;
        if !generation.is_outstanding() {
            // Late or duplicate callback; the first result stands.
            return Ok(generation);
        }

        let now = Utc::now();
        let mut batch = WriteBatch::default();

        match outcome {
            GenerationOutcome::Success { artifact_url } => {
                generation.status = GenerationStatus::Completed;
                generation.artifact_url = artifact_url;
            }
            GenerationOutcome::Failure { error } => {
                generation.status = GenerationStatus::Failed;
                generation.error = Some(error);
                self.stage_refund(&mut batch, &mut generation, "generation failed", now)?;
            }
        }
        generation.updated_at = now;

        let cf_generations = self.cf(cf::GENERATIONS)?;
        batch.put_cf(
            &cf_generations,
            keys::generation_key(generation_id),
            Self::serialize(&generation)?,
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(
            generation_id = %generation_id,
            status = generation.status.as_str(),
            credit_refunded = generation.credit_refunded,
            "worker result recorded"
        );

        Ok(generation)
    }

    /// Expire an outstanding generation that the worker never reported on,
    /// refunding the consumed unit.
    ///
    /// Returns `true` if the generation transitioned to `Expired`, `false`
    /// if it had already reached a terminal state.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the generation is missing.
    /// - `StoreError::LockTimeout` on lock contention past the timeout.
    pub async fn expire_generation(&self, generation_id: &GenerationId) -> Result<bool> {
        let probe = self.load_generation(generation_id)?;
        let _guard = self.locks.acquire(&probe.user_id, self.lock_timeout).await?;

        let mut generation = self.load_generation(generation_id)?;
        if !generation.is_outstanding() {
            return Ok(false);
        }

        let now = Utc::now();
        let mut batch = WriteBatch::default();

        generation.status = GenerationStatus::Expired;
        self.stage_refund(&mut batch, &mut generation, "generation timed out", now)?;
        generation.updated_at = now;

        let cf_generations = self.cf(cf::GENERATIONS)?;
        batch.put_cf(
            &cf_generations,
            keys::generation_key(generation_id),
            Self::serialize(&generation)?,
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::warn!(
            user_id = %generation.user_id,
            generation_id = %generation_id,
            payment_method = generation.payment_method.as_str(),
            "generation expired"
        );

        Ok(true)
    }

    /// Credit a provider payment, exactly once per `external_payment_id`.
    ///
    /// Returns the new token balance. The payment key, balance change, and
    /// ledger row commit in one batch, so a replayed webhook either sees
    /// the payment key (and errors) or the whole credit is absent.
    ///
    /// # Errors
    ///
    /// - `StoreError::DuplicatePayment` if this payment was already
    ///   credited.
    /// - `StoreError::NotFound` if the account is missing.
    /// - `StoreError::LockTimeout` on lock contention past the timeout.
    pub async fn credit_purchase(
        &self,
        user_id: &UserId,
        external_payment_id: &str,
        tokens: i64,
        description: String,
    ) -> Result<i64> {
        let _guard = self.locks.acquire(user_id, self.lock_timeout).await?;

        if self.has_payment(external_payment_id)? {
            return Err(StoreError::DuplicatePayment {
                external_payment_id: external_payment_id.to_string(),
            });
        }

        let mut account = self
            .get_account(user_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "account",
                id: user_id.to_string(),
            })?;

        account.balance += tokens;
        account.total_purchased += tokens;
        account.updated_at = Utc::now();

        let tx = TokenTransaction::purchase(
            *user_id,
            tokens,
            account.balance,
            external_payment_id.to_string(),
            description,
        );

        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let cf_payments = self.cf(cf::PAYMENTS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_accounts,
            keys::account_key(user_id),
            Self::serialize(&account)?,
        );
        batch.put_cf(&cf_tx, keys::transaction_key(&tx.id), Self::serialize(&tx)?);
        batch.put_cf(&cf_tx_by_user, keys::user_transaction_key(user_id, &tx.id), []);
        // Payment key maps to the crediting transaction for audit lookups.
        batch.put_cf(
            &cf_payments,
            keys::payment_key(external_payment_id),
            tx.id.to_bytes(),
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::info!(
            user_id = %user_id,
            external_payment_id,
            tokens,
            new_balance = account.balance,
            "payment credited"
        );

        Ok(account.balance)
    }

    /// Credit tokens without a provider payment (admin or promotional
    /// grant). Returns the crediting ledger row.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the account is missing.
    /// - `StoreError::LockTimeout` on lock contention past the timeout.
    pub async fn grant_tokens(
        &self,
        user_id: &UserId,
        tokens: i64,
        description: String,
    ) -> Result<TokenTransaction> {
        let _guard = self.locks.acquire(user_id, self.lock_timeout).await?;

        let mut account = self
            .get_account(user_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "account",
                id: user_id.to_string(),
            })?;

        account.balance += tokens;
        account.total_purchased += tokens;
        account.updated_at = Utc::now();

        let tx = TokenTransaction::grant(*user_id, tokens, account.balance, description);

        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_accounts,
            keys::account_key(user_id),
            Self::serialize(&account)?,
        );
        batch.put_cf(&cf_tx, keys::transaction_key(&tx.id), Self::serialize(&tx)?);
        batch.put_cf(&cf_tx_by_user, keys::user_transaction_key(user_id, &tx.id), []);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::info!(
            user_id = %user_id,
            tokens,
            new_balance = account.balance,
            "tokens granted"
        );

        Ok(tx)
    }

    /// Replace the user's subscription state.
    ///
    /// Goes through the user lock because the user row also carries trial
    /// counters; a plain read-modify-write racing a trial deduction would
    /// lose one of the updates.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the user is missing.
    /// - `StoreError::LockTimeout` on lock contention past the timeout.
    pub async fn set_subscription(
        &self,
        user_id: &UserId,
        subscription: Option<Subscription>,
    ) -> Result<User> {
        let _guard = self.locks.acquire(user_id, self.lock_timeout).await?;

        let mut user = self.get_user(user_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "user",
            id: user_id.to_string(),
        })?;

        user.subscription = subscription;
        user.updated_at = Utc::now();
        self.put_user(&user)?;

        Ok(user)
    }

    /// Check the rolling-window rate limit and record this attempt if
    /// allowed.
    ///
    /// Counts attempts in the trailing `window`; at `max_requests` the
    /// request is denied with the seconds until the oldest in-window
    /// attempt ages out (rounded up, never zero). Denied attempts are not
    /// recorded.
    ///
    /// # Errors
    ///
    /// - `StoreError::LockTimeout` on lock contention past the timeout.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn check_and_record_rate_limit(
        &self,
        user_id: &UserId,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateLimitDecision> {
        let _guard = self.locks.acquire(user_id, self.lock_timeout).await?;

        let cf_rate = self.cf(cf::RATE_LIMIT)?;
        let prefix = keys::rate_limit_prefix(user_id);

        let now_ms = now_unix_ms();
        let window_ms = window.as_millis() as u64;
        let cutoff_ms = now_ms.saturating_sub(window_ms);

        let mut in_window: u32 = 0;
        let mut oldest_in_window_ms: Option<u64> = None;

        let iter = self
            .db
            .iterator_cf(&cf_rate, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            if !key.starts_with(&prefix) {
                break;
            }

            let attempted_ms = keys::rate_limit_timestamp_ms(&key);
            if attempted_ms < cutoff_ms {
                // Aged out; left for the purge sweep.
                continue;
            }

            if oldest_in_window_ms.is_none() {
                oldest_in_window_ms = Some(attempted_ms);
            }
            in_window += 1;
        }

        if in_window >= max_requests {
            let age_ms = now_ms.saturating_sub(oldest_in_window_ms.unwrap_or(now_ms));
            let retry_after_seconds = window_ms.saturating_sub(age_ms).div_ceil(1000).max(1);
            return Ok(RateLimitDecision {
                allowed: false,
                retry_after_seconds,
            });
        }

        let record = RateLimitRecord::new(*user_id);
        self.db
            .put_cf(
                &cf_rate,
                keys::rate_limit_key(user_id, &Ulid::new()),
                Self::serialize(&record)?,
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(RateLimitDecision {
            allowed: true,
            retry_after_seconds: 0,
        })
    }

    /// Delete rate-limit records older than `retention`. Returns the
    /// number removed.
    ///
    /// Correctness does not depend on this: the limiter skips aged-out
    /// records when counting. The sweep only bounds storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    #[allow(clippy::cast_possible_truncation)]
    pub fn purge_rate_limit_records(&self, retention: Duration) -> Result<usize> {
        let cf_rate = self.cf(cf::RATE_LIMIT)?;
        let cutoff_ms = now_unix_ms().saturating_sub(retention.as_millis() as u64);

        let mut expired: Vec<Vec<u8>> = Vec::new();
        for item in self.db.iterator_cf(&cf_rate, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if keys::rate_limit_timestamp_ms(&key) < cutoff_ms {
                expired.push(key.to_vec());
            }
        }

        let removed = expired.len();
        if removed > 0 {
            let mut batch = WriteBatch::default();
            for key in expired {
                batch.delete_cf(&cf_rate, key);
            }
            self.db
                .write(batch)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        Ok(removed)
    }

    /// List outstanding generations authorized before `cutoff`.
    ///
    /// Full scan of the generations column family; callers run this from
    /// the timeout sweep, not a request path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_stale_generations(&self, cutoff: DateTime<Utc>) -> Result<Vec<GenerationId>> {
        let cf_generations = self.cf(cf::GENERATIONS)?;

        let mut stale = Vec::new();
        for item in self.db.iterator_cf(&cf_generations, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let generation: Generation = Self::deserialize(&value)?;
            if generation.is_outstanding() && generation.created_at < cutoff {
                stale.push(generation.id);
            }
        }

        Ok(stale)
    }

    /// Load a generation or fail with `NotFound`.
    fn load_generation(&self, generation_id: &GenerationId) -> Result<Generation> {
        self.get_generation(generation_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "generation",
                id: generation_id.to_string(),
            })
    }

    /// Stage the mutations that restore a generation's consumed unit onto
    /// `batch`, marking the generation refunded.
    ///
    /// Returns `false` without staging anything if there is nothing to
    /// restore. Caller holds the user lock and commits the batch.
    fn stage_refund(
        &self,
        batch: &mut WriteBatch,
        generation: &mut Generation,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if generation.credit_refunded {
            return Ok(false);
        }

        let user_id = generation.user_id;
        match generation.payment_method {
            PaymentMethod::Subscription => return Ok(false),
            PaymentMethod::Trial => {
                let mut user = self.get_user(&user_id)?.ok_or_else(|| StoreError::NotFound {
                    entity: "user",
                    id: user_id.to_string(),
                })?;
                user.trial_remaining += 1;
                user.trial_used = user.trial_used.saturating_sub(1);
                user.updated_at = now;

                let cf_users = self.cf(cf::USERS)?;
                batch.put_cf(&cf_users, keys::user_key(&user_id), Self::serialize(&user)?);
            }
            PaymentMethod::Token => {
                let mut account =
                    self.get_account(&user_id)?
                        .ok_or_else(|| StoreError::NotFound {
                            entity: "account",
                            id: user_id.to_string(),
                        })?;
                account.balance += 1;
                account.total_consumed -= 1;
                account.updated_at = now;

                let tx = TokenTransaction::refund(
                    user_id,
                    1,
                    account.balance,
                    generation.id,
                    reason.to_string(),
                );

                let cf_accounts = self.cf(cf::ACCOUNTS)?;
                let cf_tx = self.cf(cf::TRANSACTIONS)?;
                let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
                batch.put_cf(
                    &cf_accounts,
                    keys::account_key(&user_id),
                    Self::serialize(&account)?,
                );
                batch.put_cf(&cf_tx, keys::transaction_key(&tx.id), Self::serialize(&tx)?);
                batch.put_cf(
                    &cf_tx_by_user,
                    keys::user_transaction_key(&user_id, &tx.id),
                    [],
                );
            }
        }

        generation.credit_refunded = true;
        generation.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_credits_core::{SubscriptionStatus, SubscriptionTier, TransactionType};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            address: "12 Cedar Ct, Portland OR".into(),
            areas: vec!["front_yard".into()],
            style: "modern_native".into(),
            params: serde_json::json!({}),
        }
    }

    fn active_subscription() -> Subscription {
        let now = Utc::now();
        Subscription {
            tier: SubscriptionTier::Monthly,
            status: SubscriptionStatus::Active,
            reference_id: "sub_live".into(),
            current_period_end: now + chrono::Duration::days(14),
            cancel_at_period_end: false,
            created_at: now,
        }
    }

    /// Register a user with the given trial allowance and token balance.
    async fn funded_user(store: &RocksStore, trial: u32, tokens: i64) -> UserId {
        let user_id = UserId::generate();
        store.register_user(&user_id, trial).await.unwrap();
        if tokens > 0 {
            store
                .credit_purchase(&user_id, &format!("pay_{user_id}"), tokens, "pack".into())
                .await
                .unwrap();
        }
        user_id
    }

    #[tokio::test]
    async fn register_creates_user_and_account() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        let (user, account) = store.register_user(&user_id, 3).await.unwrap();
        assert_eq!(user.trial_remaining, 3);
        assert_eq!(account.balance, 0);

        assert!(store.get_user(&user_id).unwrap().is_some());
        assert!(store.get_account(&user_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn register_twice_fails() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        store.register_user(&user_id, 3).await.unwrap();
        let result = store.register_user(&user_id, 3).await;

        assert!(matches!(
            result,
            Err(StoreError::AlreadyRegistered { user_id: dup }) if dup == user_id
        ));
    }

    #[tokio::test]
    async fn deduct_prefers_subscription_and_consumes_nothing() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 2, 5).await;
        store
            .set_subscription(&user_id, Some(active_subscription()))
            .await
            .unwrap();

        let generation = store.deduct(&user_id, request()).await.unwrap();
        assert_eq!(generation.payment_method, PaymentMethod::Subscription);

        let user = store.get_user(&user_id).unwrap().unwrap();
        let account = store.get_account(&user_id).unwrap().unwrap();
        assert_eq!(user.trial_remaining, 2);
        assert_eq!(account.balance, 5);
    }

    #[tokio::test]
    async fn deduct_uses_trial_before_tokens() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 1, 5).await;

        let generation = store.deduct(&user_id, request()).await.unwrap();
        assert_eq!(generation.payment_method, PaymentMethod::Trial);

        let user = store.get_user(&user_id).unwrap().unwrap();
        let account = store.get_account(&user_id).unwrap().unwrap();
        assert_eq!(user.trial_remaining, 0);
        assert_eq!(user.trial_used, 1);
        assert_eq!(account.balance, 5);
    }

    #[tokio::test]
    async fn deduct_uses_tokens_when_trial_exhausted() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 5).await;

        let generation = store.deduct(&user_id, request()).await.unwrap();
        assert_eq!(generation.payment_method, PaymentMethod::Token);

        let account = store.get_account(&user_id).unwrap().unwrap();
        assert_eq!(account.balance, 4);
        assert_eq!(account.total_consumed, 1);

        // The spend appended a ledger row referencing the generation.
        let transactions = store.list_transactions_by_user(&user_id, 10, 0).unwrap();
        assert_eq!(transactions[0].transaction_type, TransactionType::Generation);
        assert_eq!(transactions[0].amount, -1);
        assert_eq!(transactions[0].generation_id, Some(generation.id));
    }

    #[tokio::test]
    async fn deduct_denied_when_everything_exhausted() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 0).await;

        let result = store.deduct(&user_id, request()).await;
        assert!(matches!(
            result,
            Err(StoreError::InsufficientCredits {
                trial_remaining: 0,
                token_balance: 0,
            })
        ));
    }

    #[tokio::test]
    async fn lapsed_subscription_falls_back_to_trial() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 1, 0).await;

        let mut subscription = active_subscription();
        subscription.current_period_end = Utc::now() - chrono::Duration::hours(1);
        store
            .set_subscription(&user_id, Some(subscription))
            .await
            .unwrap();

        let generation = store.deduct(&user_id, request()).await.unwrap();
        assert_eq!(generation.payment_method, PaymentMethod::Trial);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deductions_never_overspend() {
        let (store, _dir) = create_test_store();
        let store = Arc::new(store);
        let user_id = funded_user(&store, 0, 3).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(
                async move { store.deduct(&user_id, request()).await },
            ));
        }

        let mut granted = 0;
        let mut denied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(StoreError::InsufficientCredits { .. }) => denied += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(denied, 5);

        let account = store.get_account(&user_id).unwrap().unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.total_consumed, 3);
        assert_eq!(
            account.balance,
            account.total_purchased - account.total_consumed
        );
    }

    #[tokio::test]
    async fn refund_restores_trial_and_is_idempotent() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 1, 0).await;

        let generation = store.deduct(&user_id, request()).await.unwrap();
        assert_eq!(store.get_user(&user_id).unwrap().unwrap().trial_remaining, 0);

        assert!(store.refund(&generation.id, "worker crash").await.unwrap());
        let user = store.get_user(&user_id).unwrap().unwrap();
        assert_eq!(user.trial_remaining, 1);
        assert_eq!(user.trial_used, 0);

        // Replays restore nothing.
        assert!(!store.refund(&generation.id, "worker crash").await.unwrap());
        assert!(!store.refund(&generation.id, "worker crash").await.unwrap());
        assert_eq!(store.get_user(&user_id).unwrap().unwrap().trial_remaining, 1);
    }

    #[tokio::test]
    async fn refund_restores_token_and_appends_ledger_row() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 3).await;

        let generation = store.deduct(&user_id, request()).await.unwrap();
        assert_eq!(store.get_account(&user_id).unwrap().unwrap().balance, 2);

        assert!(store.refund(&generation.id, "generation failed").await.unwrap());

        let account = store.get_account(&user_id).unwrap().unwrap();
        assert_eq!(account.balance, 3);
        assert_eq!(account.total_consumed, 0);

        let transactions = store.list_transactions_by_user(&user_id, 10, 0).unwrap();
        assert_eq!(transactions.len(), 3); // purchase, spend, refund
        assert_eq!(transactions[0].transaction_type, TransactionType::Refund);
        assert_eq!(transactions[0].amount, 1);
        assert_eq!(transactions[0].generation_id, Some(generation.id));

        assert!(!store.refund(&generation.id, "again").await.unwrap());
        assert_eq!(store.list_transactions_by_user(&user_id, 10, 0).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn subscription_refund_is_noop() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 0).await;
        store
            .set_subscription(&user_id, Some(active_subscription()))
            .await
            .unwrap();

        let generation = store.deduct(&user_id, request()).await.unwrap();
        assert!(!store.refund(&generation.id, "worker crash").await.unwrap());

        let retrieved = store.get_generation(&generation.id).unwrap().unwrap();
        assert!(!retrieved.credit_refunded);
    }

    #[tokio::test]
    async fn record_result_success_keeps_the_charge() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 3).await;
        let generation = store.deduct(&user_id, request()).await.unwrap();

        let updated = store
            .record_result(
                &generation.id,
                GenerationOutcome::Success {
                    artifact_url: Some("https://cdn.arbor.build/renders/a1.png".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, GenerationStatus::Completed);
        assert!(!updated.credit_refunded);
        assert_eq!(store.get_account(&user_id).unwrap().unwrap().balance, 2);
    }

    #[tokio::test]
    async fn record_result_failure_refunds_in_one_write() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 3).await;
        let generation = store.deduct(&user_id, request()).await.unwrap();

        let updated = store
            .record_result(
                &generation.id,
                GenerationOutcome::Failure {
                    error: "render pipeline OOM".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, GenerationStatus::Failed);
        assert!(updated.credit_refunded);
        assert_eq!(updated.error.as_deref(), Some("render pipeline OOM"));
        assert_eq!(store.get_account(&user_id).unwrap().unwrap().balance, 3);
    }

    #[tokio::test]
    async fn duplicate_result_callback_is_ignored() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 3).await;
        let generation = store.deduct(&user_id, request()).await.unwrap();

        store
            .record_result(
                &generation.id,
                GenerationOutcome::Failure {
                    error: "render pipeline OOM".into(),
                },
            )
            .await
            .unwrap();

        // Redelivered failure does not refund twice; a late success does
        // not overwrite the recorded failure.
        let replayed = store
            .record_result(
                &generation.id,
                GenerationOutcome::Failure {
                    error: "render pipeline OOM".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(replayed.status, GenerationStatus::Failed);

        let late_success = store
            .record_result(
                &generation.id,
                GenerationOutcome::Success { artifact_url: None },
            )
            .await
            .unwrap();
        assert_eq!(late_success.status, GenerationStatus::Failed);

        assert_eq!(store.get_account(&user_id).unwrap().unwrap().balance, 3);
    }

    #[tokio::test]
    async fn expire_refunds_and_is_idempotent() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 1, 0).await;
        let generation = store.deduct(&user_id, request()).await.unwrap();

        assert!(store.expire_generation(&generation.id).await.unwrap());

        let expired = store.get_generation(&generation.id).unwrap().unwrap();
        assert_eq!(expired.status, GenerationStatus::Expired);
        assert!(expired.credit_refunded);
        assert_eq!(store.get_user(&user_id).unwrap().unwrap().trial_remaining, 1);

        assert!(!store.expire_generation(&generation.id).await.unwrap());
        assert_eq!(store.get_user(&user_id).unwrap().unwrap().trial_remaining, 1);
    }

    #[tokio::test]
    async fn expire_skips_completed_generations() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 3).await;
        let generation = store.deduct(&user_id, request()).await.unwrap();

        store
            .record_result(
                &generation.id,
                GenerationOutcome::Success { artifact_url: None },
            )
            .await
            .unwrap();

        assert!(!store.expire_generation(&generation.id).await.unwrap());
        let retrieved = store.get_generation(&generation.id).unwrap().unwrap();
        assert_eq!(retrieved.status, GenerationStatus::Completed);
    }

    #[tokio::test]
    async fn credit_purchase_is_exactly_once() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        store.register_user(&user_id, 0).await.unwrap();

        let balance = store
            .credit_purchase(&user_id, "pay_abc", 10, "10-token pack".into())
            .await
            .unwrap();
        assert_eq!(balance, 10);

        let replay = store
            .credit_purchase(&user_id, "pay_abc", 10, "10-token pack".into())
            .await;
        assert!(matches!(
            replay,
            Err(StoreError::DuplicatePayment { external_payment_id }) if external_payment_id == "pay_abc"
        ));

        let account = store.get_account(&user_id).unwrap().unwrap();
        assert_eq!(account.balance, 10);
        assert_eq!(account.total_purchased, 10);
        assert_eq!(store.list_transactions_by_user(&user_id, 10, 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn grant_tokens_appends_ledger_row() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        store.register_user(&user_id, 0).await.unwrap();

        let tx = store
            .grant_tokens(&user_id, 5, "launch promo".into())
            .await
            .unwrap();
        assert_eq!(tx.balance_after, 5);
        assert!(tx.external_payment_id.is_none());

        assert_eq!(store.get_account(&user_id).unwrap().unwrap().balance, 5);
    }

    #[tokio::test]
    async fn rate_limit_allows_up_to_max_then_denies() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            let decision = store
                .check_and_record_rate_limit(&user_id, 3, window)
                .await
                .unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.retry_after_seconds, 0);
        }

        let denied = store
            .check_and_record_rate_limit(&user_id, 3, window)
            .await
            .unwrap();
        assert!(!denied.allowed);
        // The oldest attempt is only milliseconds old, so nearly the whole
        // window remains.
        assert!(denied.retry_after_seconds >= 59);
        assert!(denied.retry_after_seconds <= 60);
    }

    #[tokio::test]
    async fn rate_limit_frees_after_window_elapses() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let window = Duration::from_millis(300);

        assert!(store
            .check_and_record_rate_limit(&user_id, 1, window)
            .await
            .unwrap()
            .allowed);

        let denied = store
            .check_and_record_rate_limit(&user_id, 1, window)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds >= 1);

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(store
            .check_and_record_rate_limit(&user_id, 1, window)
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn rate_limit_is_per_user() {
        let (store, _dir) = create_test_store();
        let first = UserId::generate();
        let second = UserId::generate();
        let window = Duration::from_secs(60);

        assert!(store
            .check_and_record_rate_limit(&first, 1, window)
            .await
            .unwrap()
            .allowed);
        assert!(!store
            .check_and_record_rate_limit(&first, 1, window)
            .await
            .unwrap()
            .allowed);

        assert!(store
            .check_and_record_rate_limit(&second, 1, window)
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test]
    async fn purge_removes_only_aged_records() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            store
                .check_and_record_rate_limit(&user_id, 10, window)
                .await
                .unwrap();
        }

        // Everything is seconds fresh; a long retention removes nothing.
        assert_eq!(
            store.purge_rate_limit_records(Duration::from_secs(60)).unwrap(),
            0
        );

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Zero retention ages everything out.
        assert_eq!(store.purge_rate_limit_records(Duration::ZERO).unwrap(), 3);
        assert_eq!(store.purge_rate_limit_records(Duration::ZERO).unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_generations_listed_by_cutoff() {
        let (store, _dir) = create_test_store();
        let user_id = funded_user(&store, 0, 3).await;

        let outstanding = store.deduct(&user_id, request()).await.unwrap();
        let completed = store.deduct(&user_id, request()).await.unwrap();
        store
            .record_result(
                &completed.id,
                GenerationOutcome::Success { artifact_url: None },
            )
            .await
            .unwrap();

        // A cutoff in the future catches everything still outstanding.
        let stale = store
            .list_stale_generations(Utc::now() + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(stale, vec![outstanding.id]);

        // A cutoff in the past catches nothing.
        let stale = store
            .list_stale_generations(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open_with_lock_timeout(dir.path(), Duration::from_millis(50))
            .unwrap();
        let user_id = UserId::generate();
        store.register_user(&user_id, 1).await.unwrap();

        let _guard = store
            .locks
            .acquire(&user_id, Duration::from_secs(5))
            .await
            .unwrap();

        let result = store.deduct(&user_id, request()).await;
        assert!(matches!(
            result,
            Err(StoreError::LockTimeout { user_id: blocked }) if blocked == user_id
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refunds_apply_once() {
        let (store, _dir) = create_test_store();
        let store = Arc::new(store);
        let user_id = funded_user(&store, 0, 2).await;

        let first = store.deduct(&user_id, request()).await.unwrap();
        let second = store.deduct(&user_id, request()).await.unwrap();

        let mut handles = Vec::new();
        for generation_id in [first.id, second.id, first.id, second.id, first.id] {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.refund(&generation_id, "worker crash").await
            }));
        }

        let mut restored = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                restored += 1;
            }
        }

        // One restore per generation, no matter how many refund attempts.
        assert_eq!(restored, 2);

        let account = store.get_account(&user_id).unwrap().unwrap();
        assert_eq!(account.balance, 2);
        assert_eq!(account.total_consumed, 0);

        // purchase + 2 spends + 2 refunds
        assert_eq!(store.list_transactions_by_user(&user_id, 10, 0).unwrap().len(), 5);
    }
}
