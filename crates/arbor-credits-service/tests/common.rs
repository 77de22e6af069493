//! Common test utilities for arbor-credits integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use axum::Router;
use axum_test::TestServer;
use tempfile::TempDir;

use arbor_credits_core::UserId;
use arbor_credits_service::{create_router, AppState, ServiceConfig};
use arbor_credits_store::RocksStore;

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Temporary directory for the database (kept alive for test duration).
    pub _temp_dir: TempDir,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
    /// The service API key for worker callbacks.
    pub service_api_key: String,
    /// The admin API key for grant endpoints.
    pub admin_api_key: String,
}

impl TestHarness {
    /// Create a new test harness with a fresh database.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Create a harness after adjusting the default test configuration.
    pub fn with_config(adjust: impl FnOnce(&mut ServiceConfig)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = RocksStore::open(temp_dir.path()).expect("Failed to open store");

        let service_api_key = "test-service-key".to_string();
        let admin_api_key = "test-admin-key".to_string();

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            data_dir: temp_dir.path().to_string_lossy().to_string(),
            auth_base_url: "http://localhost".into(),
            auth_audience: "arbor-credits".into(),
            service_api_key: Some(service_api_key.clone()),
            admin_api_key: Some(admin_api_key.clone()),
            payment_webhook_secret: None,
            frontend_url: "http://localhost:3000".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            trial_credits: 3,
            // High enough that tests not about rate limiting never trip it
            rate_limit_max_requests: 100,
            rate_limit_window_seconds: 60,
            rate_limit_retention_seconds: 120,
            lock_timeout_seconds: 5,
            generation_timeout_seconds: 300,
            sweep_interval_seconds: 60,
        };
        adjust(&mut config);

        let state = AppState::new(Arc::new(store), config);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");
        let test_user_id = UserId::generate();

        Self {
            server,
            _temp_dir: temp_dir,
            test_user_id,
            service_api_key,
            admin_api_key,
        }
    }

    /// Get the authorization header for the default test user.
    pub fn user_auth_header(&self) -> String {
        format!("Bearer test-token:{}", self.test_user_id)
    }

    /// Get the authorization header for a specific user.
    pub fn auth_for(user_id: &UserId) -> String {
        format!("Bearer test-token:{user_id}")
    }

    /// Register the default test user's account.
    pub async fn register(&self) {
        self.server
            .post("/v1/accounts")
            .add_header("authorization", self.user_auth_header())
            .await
            .assert_status_ok();
    }

    /// Grant tokens to the default test user via the admin endpoint.
    pub async fn grant_tokens(&self, amount: i64) {
        self.server
            .post("/v1/credits/grant")
            .add_header("x-admin-key", self.admin_api_key.clone())
            .json(&serde_json::json!({
                "user_id": self.test_user_id.to_string(),
                "amount": amount,
                "reason": "Test funding"
            }))
            .await
            .assert_status_ok();
    }

    /// Submit a generation request for the default test user.
    pub async fn post_generation(&self) -> axum_test::TestResponse {
        self.server
            .post("/v1/generations")
            .add_header("authorization", self.user_auth_header())
            .json(&serde_json::json!({
                "address": "12 Cedar Ct, Portland OR",
                "areas": ["front_yard"],
                "style": "modern"
            }))
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
