//! Payment provider webhook handler.
//!
//! The provider delivers events at least once, so every branch after
//! signature verification must be idempotent and answer 200; a non-200
//! response triggers provider-side retries. Crediting is deduplicated by
//! the ledger's payment key, never by inspecting delivery attempts.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use arbor_credits_core::{
    Subscription, SubscriptionStatus, SubscriptionTier, UserId,
};
use arbor_credits_store::{Store, StoreError};

use crate::crypto::{constant_time_eq, hmac_sha256_hex};
use crate::error::ApiError;
use crate::state::AppState;

/// Signature header sent by the payment provider.
const SIGNATURE_HEADER: &str = "x-payment-signature";

/// Payment provider event envelope.
#[derive(Debug, Deserialize)]
pub struct PaymentEvent {
    /// Event ID.
    pub id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: serde_json::Value,
}

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was received and verified.
    pub received: bool,
    /// Whether this delivery changed a balance.
    pub credited: bool,
}

/// Handle payment provider webhooks.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    verify_signature(&state, &headers, &body)?;

    // Past this point the provider expects a 200; malformed payloads are
    // acknowledged (and logged) rather than bounced into a retry loop.
    let event: PaymentEvent = match serde_json::from_str(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable payment webhook body");
            return Ok(Json(WebhookResponse {
                received: true,
                credited: false,
            }));
        }
    };

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Received payment webhook"
    );

    let credited = match event.event_type.as_str() {
        "payment.completed" => handle_payment_completed(&state, &event).await?,
        "subscription.updated" => {
            handle_subscription_updated(&state, &event.data).await?;
            false
        }
        "subscription.cancelled" => {
            handle_subscription_cancelled(&state, &event.data).await?;
            false
        }
        _ => {
            tracing::debug!(event_type = %event.event_type, "Unhandled payment event");
            false
        }
    };

    Ok(Json(WebhookResponse {
        received: true,
        credited,
    }))
}

/// Verify the webhook signature if a secret is configured.
fn verify_signature(state: &AppState, headers: &HeaderMap, body: &str) -> Result<(), ApiError> {
    let Some(secret) = &state.config.payment_webhook_secret else {
        // Development mode: accept unsigned deliveries
        tracing::warn!("Payment webhook secret not configured - skipping signature verification");
        return Ok(());
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::InvalidSignature)?;

    let expected = hmac_sha256_hex(secret, body);
    if !constant_time_eq(signature, &expected) {
        return Err(ApiError::InvalidSignature);
    }

    Ok(())
}

/// Credit a completed token purchase.
///
/// Returns whether this delivery actually credited the balance. Replays
/// and already-seen payment IDs come back `false`.
async fn handle_payment_completed(state: &AppState, event: &PaymentEvent) -> Result<bool, ApiError> {
    let data = &event.data;

    let Some(payment_id) = data.get("payment_id").and_then(|v| v.as_str()) else {
        tracing::warn!(event_id = %event.id, "payment.completed missing payment_id");
        return Ok(false);
    };
    let Some(user_id) = data
        .get("user_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<UserId>().ok())
    else {
        tracing::warn!(event_id = %event.id, "payment.completed missing or invalid user_id");
        return Ok(false);
    };
    let tokens = data.get("tokens").and_then(serde_json::Value::as_i64).unwrap_or(0);
    if tokens <= 0 {
        tracing::warn!(
            event_id = %event.id,
            tokens = %tokens,
            "payment.completed with non-positive token amount"
        );
        return Ok(false);
    }

    let description = format!("Purchased {tokens} tokens (payment {payment_id})");

    match state
        .store
        .credit_purchase(&user_id, payment_id, tokens, description)
        .await
    {
        Ok(balance) => {
            tracing::info!(
                user_id = %user_id,
                payment_id = %payment_id,
                tokens = %tokens,
                new_balance = %balance,
                "Purchase credited"
            );
            Ok(true)
        }
        Err(StoreError::DuplicatePayment { .. }) => {
            tracing::info!(
                payment_id = %payment_id,
                "Duplicate payment delivery ignored"
            );
            Ok(false)
        }
        Err(StoreError::NotFound { .. }) => {
            tracing::warn!(
                user_id = %user_id,
                payment_id = %payment_id,
                "payment.completed for unknown account"
            );
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Apply a subscription create/update event to the user record.
async fn handle_subscription_updated(
    state: &AppState,
    data: &serde_json::Value,
) -> Result<(), ApiError> {
    let Some(user_id) = data
        .get("user_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<UserId>().ok())
    else {
        tracing::warn!("subscription.updated missing or invalid user_id");
        return Ok(());
    };

    let Some(user) = state.store.get_user(&user_id)? else {
        tracing::warn!(user_id = %user_id, "subscription.updated for unknown account");
        return Ok(());
    };

    let reference_id = data
        .get("reference_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let tier = match data.get("tier").and_then(|v| v.as_str()) {
        Some("annual") => SubscriptionTier::Annual,
        _ => SubscriptionTier::Monthly,
    };

    let status = match data.get("status").and_then(|v| v.as_str()) {
        Some("active") => SubscriptionStatus::Active,
        Some("past_due") => SubscriptionStatus::PastDue,
        Some("cancelled") | None => SubscriptionStatus::Cancelled,
        Some(other) => {
            tracing::warn!(status = %other, "Unknown subscription status, treating as cancelled");
            SubscriptionStatus::Cancelled
        }
    };

    let current_period_end = data
        .get("current_period_end")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

    let cancel_at_period_end = data
        .get("cancel_at_period_end")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    // Renewals keep the original start date; a new reference is a new
    // subscription
    let created_at = user
        .subscription
        .as_ref()
        .filter(|s| s.reference_id == reference_id)
        .map_or_else(Utc::now, |s| s.created_at);

    let subscription = Subscription {
        tier,
        status,
        reference_id,
        current_period_end,
        cancel_at_period_end,
        created_at,
    };

    state
        .store
        .set_subscription(&user_id, Some(subscription))
        .await?;

    tracing::info!(
        user_id = %user_id,
        tier = %tier.as_str(),
        status = ?status,
        "Subscription updated"
    );

    Ok(())
}

/// Mark a subscription cancelled, keeping the record for history.
async fn handle_subscription_cancelled(
    state: &AppState,
    data: &serde_json::Value,
) -> Result<(), ApiError> {
    let Some(user_id) = data
        .get("user_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<UserId>().ok())
    else {
        tracing::warn!("subscription.cancelled missing or invalid user_id");
        return Ok(());
    };

    let Some(user) = state.store.get_user(&user_id)? else {
        tracing::warn!(user_id = %user_id, "subscription.cancelled for unknown account");
        return Ok(());
    };

    let Some(mut subscription) = user.subscription else {
        tracing::debug!(user_id = %user_id, "subscription.cancelled with no subscription on file");
        return Ok(());
    };

    subscription.status = SubscriptionStatus::Cancelled;
    state
        .store
        .set_subscription(&user_id, Some(subscription))
        .await?;

    tracing::info!(user_id = %user_id, "Subscription cancelled");

    Ok(())
}
