//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, credits, generations, health, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for generation endpoints.
/// The deduction path serializes per user, so this bounds only the
/// cross-user fan-in.
const GENERATION_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Accounts (Arbor ID JWT auth)
/// - `POST /v1/accounts` - Register account
/// - `GET /v1/accounts/me` - Get current user's account
///
/// ## Credits (Arbor ID JWT auth; grant requires admin key)
/// - `GET /v1/credits/balance` - Get current balances
/// - `GET /v1/credits/transactions` - List ledger history
/// - `POST /v1/credits/grant` - Grant tokens manually
///
/// ## Generations (Arbor ID JWT auth; result requires service key)
/// - `POST /v1/generations` - Authorize a generation
/// - `GET /v1/generations/:id` - Get a generation
/// - `POST /v1/generations/:id/result` - Worker result callback
///
/// ## Webhooks (Signature verification)
/// - `POST /webhooks/payment` - Payment provider events
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // Generation routes get their own concurrency limit: they carry the
    // product's traffic spikes and must not crowd out account lookups.
    let generation_routes = Router::new()
        .route("/", post(generations::create_generation))
        .route("/:id", get(generations::get_generation))
        .route("/:id/result", post(generations::record_result))
        .layer(ConcurrencyLimitLayer::new(GENERATION_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Accounts
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/me", get(accounts::get_account))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/credits/grant", post(credits::grant_tokens))
        // Generation routes (with their own concurrency limit)
        .nest("/generations", generation_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes
        .nest("/v1", api_routes)
        // Webhooks (no concurrency limit - delivery rate is controlled by
        // the provider)
        .route("/webhooks/payment", post(webhooks::payment_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
