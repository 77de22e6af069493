//! Arbor Credits HTTP API Service.
//!
//! This crate provides the HTTP API for the arbor-credits service, including:
//!
//! - Account registration and profile lookup
//! - Credit balance and transaction history
//! - Generation authorization and result callbacks
//! - Payment provider webhooks
//!
//! # Authentication
//!
//! The service supports three authentication methods:
//!
//! 1. **Arbor ID JWT tokens** - For end-user requests (the web app)
//! 2. **Service API keys** - For render-worker callbacks
//! 3. **Admin API keys** - For manual credit grants

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers need async for the router even when they don't await

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod sweeps;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
