//! Generation records for arbor-credits.
//!
//! A `Generation` row is created when a request is authorized and a unit
//! of entitlement has been consumed (or covered by a subscription). It is
//! the refund target: `credit_refunded` flips from false to true exactly
//! once over the row's lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GenerationId, UserId};

/// The render request as submitted by the user.
///
/// Carried on the generation row so the worker callback and any retries
/// have the full request context without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Property address to render.
    pub address: String,

    /// Areas of the property to design (e.g. `front_yard`, `backyard`).
    pub areas: Vec<String>,

    /// Design style preset.
    pub style: String,

    /// Free-form style parameters forwarded to the render pipeline.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A generation authorized against a user's entitlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    /// Unique generation ID.
    pub id: GenerationId,

    /// The user who requested it.
    pub user_id: UserId,

    /// The request that produced it.
    pub request: GenerationRequest,

    /// Lifecycle status.
    pub status: GenerationStatus,

    /// Which entitlement paid for it.
    pub payment_method: PaymentMethod,

    /// Whether the consumed unit has been restored. Flips to true at most
    /// once; subscription generations never flip it.
    pub credit_refunded: bool,

    /// Artifact location reported by the worker on success.
    pub artifact_url: Option<String>,

    /// Worker error reported on failure.
    pub error: Option<String>,

    /// When the generation was authorized.
    pub created_at: DateTime<Utc>,

    /// When the row was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Generation {
    /// Create a new pending generation.
    #[must_use]
    pub fn new(user_id: UserId, request: GenerationRequest, payment_method: PaymentMethod) -> Self {
        let now = Utc::now();
        Self {
            id: GenerationId::generate(),
            user_id,
            request,
            status: GenerationStatus::Pending,
            payment_method,
            credit_refunded: false,
            artifact_url: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether the generation is still waiting on the worker.
    #[must_use]
    pub const fn is_outstanding(&self) -> bool {
        matches!(
            self.status,
            GenerationStatus::Pending | GenerationStatus::Processing
        )
    }
}

/// Lifecycle status of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Authorized, waiting for the worker to pick it up.
    Pending,

    /// Worker is rendering.
    Processing,

    /// Worker reported success.
    Completed,

    /// Worker reported failure.
    Failed,

    /// Worker never reported within the timeout window.
    Expired,
}

impl GenerationStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

/// Which entitlement paid for a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Covered by an active subscription; nothing was consumed.
    Subscription,

    /// Consumed a trial generation.
    Trial,

    /// Consumed a purchased token.
    Token,
}

impl PaymentMethod {
    /// Get the method name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Trial => "trial",
            Self::Token => "token",
        }
    }
}

/// Terminal outcome reported by the render worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GenerationOutcome {
    /// The render finished; the artifact may be fetched from `artifact_url`.
    Success {
        /// Location of the rendered artifact, if the worker uploaded one.
        artifact_url: Option<String>,
    },

    /// The render failed. Failure restores the consumed unit.
    Failure {
        /// Worker-reported error message.
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            address: "12 Cedar Ct, Portland OR".into(),
            areas: vec!["front_yard".into(), "backyard".into()],
            style: "modern_native".into(),
            params: serde_json::json!({ "season": "summer" }),
        }
    }

    #[test]
    fn new_generation_is_pending_and_unrefunded() {
        let generation = Generation::new(UserId::generate(), request(), PaymentMethod::Trial);

        assert_eq!(generation.status, GenerationStatus::Pending);
        assert_eq!(generation.payment_method, PaymentMethod::Trial);
        assert!(!generation.credit_refunded);
        assert!(generation.is_outstanding());
    }

    #[test]
    fn terminal_states_are_not_outstanding() {
        let mut generation = Generation::new(UserId::generate(), request(), PaymentMethod::Token);

        generation.status = GenerationStatus::Completed;
        assert!(!generation.is_outstanding());

        generation.status = GenerationStatus::Failed;
        assert!(!generation.is_outstanding());

        generation.status = GenerationStatus::Expired;
        assert!(!generation.is_outstanding());
    }

    #[test]
    fn status_and_method_names() {
        assert_eq!(GenerationStatus::Pending.as_str(), "pending");
        assert_eq!(GenerationStatus::Expired.as_str(), "expired");
        assert_eq!(PaymentMethod::Subscription.as_str(), "subscription");
        assert_eq!(PaymentMethod::Token.as_str(), "token");
    }
}
