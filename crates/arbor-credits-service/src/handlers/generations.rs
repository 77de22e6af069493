//! Generation authorization and result handlers.
//!
//! `create_generation` is the hot path: rate-limit check, entitlement
//! deduction, and the pending generation row all happen here before the
//! request is handed to the render pipeline.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use arbor_credits_core::{
    resolve_entitlement, Generation, GenerationId, GenerationOutcome, GenerationRequest,
};
use arbor_credits_store::{Store, StoreError};

use crate::auth::{AuthUser, ServiceAuth};
use crate::error::ApiError;
use crate::state::AppState;

/// Backoff before retrying a deduction that lost the user lock.
const CONFLICT_RETRY_BACKOFF_MS: u64 = 50;

/// Create generation request body.
#[derive(Debug, Deserialize)]
pub struct CreateGenerationRequest {
    /// Property address to render.
    pub address: String,
    /// Areas of the property to design.
    #[serde(default)]
    pub areas: Vec<String>,
    /// Design style preset.
    #[serde(default = "default_style")]
    pub style: String,
    /// Free-form style parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_style() -> String {
    "classic".to_string()
}

/// Generation response.
#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    /// Generation ID.
    pub id: String,
    /// Lifecycle status.
    pub status: String,
    /// Which entitlement paid for it.
    pub payment_method: String,
    /// Artifact location, present once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
    /// Worker error, present once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the consumed unit was restored.
    pub credit_refunded: bool,
    /// When the generation was authorized.
    pub created_at: String,
}

impl From<&Generation> for GenerationResponse {
    fn from(generation: &Generation) -> Self {
        Self {
            id: generation.id.to_string(),
            status: generation.status.as_str().to_string(),
            payment_method: generation.payment_method.as_str().to_string(),
            artifact_url: generation.artifact_url.clone(),
            error: generation.error.clone(),
            credit_refunded: generation.credit_refunded,
            created_at: generation.created_at.to_rfc3339(),
        }
    }
}

/// Authorize and create a new generation.
///
/// Order matters: the rate limit is checked before any entitlement work,
/// so hammering the endpoint cannot even reach the resolver. The
/// entitlement read before `deduct` is advisory (fast 402 without taking
/// the user lock); the store re-resolves under the lock.
pub async fn create_generation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateGenerationRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    if body.address.trim().is_empty() {
        return Err(ApiError::BadRequest("Address must not be empty".into()));
    }

    let decision = state
        .store
        .check_and_record_rate_limit(
            &auth.user_id,
            state.config.rate_limit_max_requests,
            Duration::from_secs(state.config.rate_limit_window_seconds),
        )
        .await?;

    if !decision.allowed {
        tracing::debug!(
            user_id = %auth.user_id,
            retry_after = %decision.retry_after_seconds,
            "Generation rate limited"
        );
        return Err(ApiError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds,
        });
    }

    let user = state
        .store
        .get_user(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;
    let account = state
        .store
        .get_account(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    if resolve_entitlement(&user, &account, Utc::now()).is_none() {
        return Err(credit_error(&state, user.trial_remaining, account.balance));
    }

    let request = GenerationRequest {
        address: body.address,
        areas: body.areas,
        style: body.style,
        params: body.params,
    };

    let result = match state.store.deduct(&auth.user_id, request.clone()).await {
        Err(StoreError::LockTimeout { .. }) => {
            // One retry after a short backoff covers transient contention
            tokio::time::sleep(Duration::from_millis(CONFLICT_RETRY_BACKOFF_MS)).await;
            state.store.deduct(&auth.user_id, request).await
        }
        other => other,
    };

    let generation = match result {
        Ok(generation) => generation,
        Err(StoreError::InsufficientCredits {
            trial_remaining,
            token_balance,
        }) => {
            return Err(credit_error(&state, trial_remaining, token_balance));
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!(
        user_id = %auth.user_id,
        generation_id = %generation.id,
        payment_method = %generation.payment_method.as_str(),
        "Generation authorized"
    );

    Ok(Json(GenerationResponse::from(&generation)))
}

/// Get a generation by ID.
///
/// Generations are owner-scoped; asking for someone else's returns 404
/// rather than 403 so IDs cannot be probed.
pub async fn get_generation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let generation_id = id
        .parse::<GenerationId>()
        .map_err(|_| ApiError::BadRequest("Invalid generation ID".into()))?;

    let generation = state
        .store
        .get_generation(&generation_id)?
        .filter(|g| g.user_id == auth.user_id)
        .ok_or_else(|| ApiError::NotFound("Generation not found".into()))?;

    Ok(Json(GenerationResponse::from(&generation)))
}

/// Result callback body from the render worker.
#[derive(Debug, Deserialize)]
pub struct GenerationResultRequest {
    /// Whether the render succeeded.
    pub success: bool,
    /// Artifact location on success.
    pub artifact_url: Option<String>,
    /// Error message on failure.
    pub error: Option<String>,
}

/// Record the terminal result of a generation (render worker only).
///
/// A failure result restores the consumed unit in the same write as the
/// status change. Calling this twice is harmless; the first result wins.
pub async fn record_result(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Path(id): Path<String>,
    Json(body): Json<GenerationResultRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let generation_id = id
        .parse::<GenerationId>()
        .map_err(|_| ApiError::BadRequest("Invalid generation ID".into()))?;

    let outcome = if body.success {
        GenerationOutcome::Success {
            artifact_url: body.artifact_url,
        }
    } else {
        GenerationOutcome::Failure {
            error: body.error.unwrap_or_else(|| "generation failed".into()),
        }
    };

    let generation = state.store.record_result(&generation_id, outcome).await?;

    tracing::info!(
        generation_id = %generation.id,
        status = %generation.status.as_str(),
        service = %service.service_name,
        "Generation result recorded"
    );

    Ok(Json(GenerationResponse::from(&generation)))
}

/// Build the payment-required error with the purchase link attached.
fn credit_error(state: &AppState, trial_remaining: u32, token_balance: i64) -> ApiError {
    ApiError::InsufficientCredits {
        trial_remaining,
        token_balance,
        purchase_url: Some(state.config.purchase_url()),
    }
}
