//! Entitlement resolution for arbor-credits.
//!
//! Given a user's balances, picks the payment method for one generation
//! by strict priority:
//!
//! 1. Active subscription (unlimited, consumes nothing)
//! 2. Trial allowance
//! 3. Purchased token balance
//! 4. Otherwise denied (`insufficient_credits`)
//!
//! The ordering maximizes subscription value and keeps trial credits as
//! the funnel fallback. A resolver read outside the user's row lock is
//! advisory only; the deduction path re-runs it under the lock before
//! mutating anything.

use chrono::{DateTime, Utc};

use crate::{PaymentMethod, TokenAccount, User};

/// Resolve the payment method for one generation.
///
/// Returns `None` when no entitlement covers the request.
#[must_use]
pub fn resolve_entitlement(
    user: &User,
    account: &TokenAccount,
    now: DateTime<Utc>,
) -> Option<PaymentMethod> {
    if user.has_active_subscription(now) {
        return Some(PaymentMethod::Subscription);
    }
    if user.has_trial_remaining() {
        return Some(PaymentMethod::Trial);
    }
    if account.has_tokens() {
        return Some(PaymentMethod::Token);
    }
    None
}
