//! User records for arbor-credits.
//!
//! This module defines the user structure including trial counters and
//! subscription state. Trial counters are mutated only by the deduction
//! and refund paths; subscription fields are updated by subscription
//! webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// A user of the generation product.
///
/// The user record tracks the trial allowance and the current
/// subscription, if any. The purchased-token balance lives in the
/// companion [`crate::TokenAccount`], created in the same transaction as
/// the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// The user ID (from Arbor ID).
    pub user_id: UserId,

    /// Trial generations still available. Never negative.
    pub trial_remaining: u32,

    /// Trial generations consumed over the account's lifetime.
    pub trial_used: u32,

    /// Current subscription, if any.
    pub subscription: Option<Subscription>,

    /// When the user was created.
    pub created_at: DateTime<Utc>,

    /// When the user was last updated.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new user with the given trial allowance.
    #[must_use]
    pub fn new(user_id: UserId, trial_credits: u32) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            trial_remaining: trial_credits,
            trial_used: 0,
            subscription: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether the user has an active subscription at `now`.
    ///
    /// Active means the provider reports `active` status and the current
    /// billing period has not ended. A subscription flagged
    /// `cancel_at_period_end` stays active until the period end passes.
    #[must_use]
    pub fn has_active_subscription(&self, now: DateTime<Utc>) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|s| s.status == SubscriptionStatus::Active && now < s.current_period_end)
    }

    /// Check whether the user has trial generations left.
    #[must_use]
    pub const fn has_trial_remaining(&self) -> bool {
        self.trial_remaining > 0
    }
}

/// A subscription to a generation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// The subscription tier.
    pub tier: SubscriptionTier,

    /// Current status of the subscription.
    pub status: SubscriptionStatus,

    /// Provider-side subscription reference.
    pub reference_id: String,

    /// End of the current billing period.
    pub current_period_end: DateTime<Utc>,

    /// Whether the subscription will lapse at the period end instead of
    /// renewing.
    pub cancel_at_period_end: bool,

    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
}

/// Available subscription tiers.
///
/// All tiers grant unlimited generations while active; they differ in
/// price and renewal cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    /// Monthly renewal.
    Monthly,

    /// Annual renewal.
    Annual,
}

impl SubscriptionTier {
    /// Get the tier name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active.
    Active,

    /// Subscription was cancelled and its period has lapsed.
    Cancelled,

    /// Payment failed, subscription is past due.
    PastDue,
}

impl SubscriptionStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::PastDue => "past_due",
        }
    }
}
