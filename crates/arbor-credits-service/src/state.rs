//! Application state.

use std::sync::Arc;

use arbor_credits_store::RocksStore;

use crate::config::ServiceConfig;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<RocksStore>,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(store: Arc<RocksStore>, config: ServiceConfig) -> Self {
        if config.payment_webhook_secret.is_none() {
            tracing::warn!("Payment webhook secret not configured - signatures will not be verified");
        }
        if config.service_api_key.is_none() {
            tracing::warn!("Service API key not configured - worker callbacks will be rejected");
        }

        Self { store, config }
    }
}
