//! Service configuration.

use serde::Deserialize;
use std::path::Path;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/arbor-credits").
    pub data_dir: String,

    /// Arbor ID JWT validation base URL (default: `<https://id.arbor.app>`).
    pub auth_base_url: String,

    /// Expected JWT audience (default: "arbor-credits").
    pub auth_audience: String,

    /// Service API key for render-worker callbacks.
    pub service_api_key: Option<String>,

    /// Admin API key for manual credit grants.
    pub admin_api_key: Option<String>,

    /// Payment provider webhook secret (optional).
    pub payment_webhook_secret: Option<String>,

    /// Frontend URL for purchase redirects.
    pub frontend_url: String,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Trial credits granted to every new account.
    pub trial_credits: u32,

    /// Maximum generation requests per user per rate-limit window.
    pub rate_limit_max_requests: u32,

    /// Rate-limit window length in seconds.
    pub rate_limit_window_seconds: u64,

    /// How long rate-limit records are retained before the purge sweep
    /// deletes them. Must be at least the window length.
    pub rate_limit_retention_seconds: u64,

    /// Per-user lock acquisition timeout in seconds.
    pub lock_timeout_seconds: u64,

    /// Generations still outstanding after this many seconds are expired
    /// and refunded by the background sweep.
    pub generation_timeout_seconds: u64,

    /// Interval between background sweep runs in seconds.
    pub sweep_interval_seconds: u64,
}

/// Payment provider secrets file structure.
#[derive(Debug, Deserialize)]
struct PaymentSecrets {
    webhook_secret: String,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        // Try to load the payment webhook secret from file first, then fall
        // back to the environment variable
        let payment_webhook_secret = load_payment_secrets();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "/data/arbor-credits".into()),
            auth_base_url: std::env::var("AUTH_BASE_URL")
                .unwrap_or_else(|_| "https://id.arbor.app".into()),
            auth_audience: std::env::var("AUTH_AUDIENCE")
                .unwrap_or_else(|_| "arbor-credits".into()),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            payment_webhook_secret,
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parsed("MAX_BODY_BYTES", 1024 * 1024), // 1MB
            request_timeout_seconds: env_parsed("REQUEST_TIMEOUT_SECONDS", 30),
            trial_credits: env_parsed("TRIAL_CREDITS", 3),
            rate_limit_max_requests: env_parsed("RATE_LIMIT_MAX_REQUESTS", 3),
            rate_limit_window_seconds: env_parsed("RATE_LIMIT_WINDOW_SECONDS", 60),
            rate_limit_retention_seconds: env_parsed("RATE_LIMIT_RETENTION_SECONDS", 120),
            lock_timeout_seconds: env_parsed("LOCK_TIMEOUT_SECONDS", 5),
            generation_timeout_seconds: env_parsed("GENERATION_TIMEOUT_SECONDS", 300),
            sweep_interval_seconds: env_parsed("SWEEP_INTERVAL_SECONDS", 60),
        }
    }

    /// URL users are sent to when they need to buy tokens.
    #[must_use]
    pub fn purchase_url(&self) -> String {
        format!("{}/credits/purchase", self.frontend_url)
    }
}

/// Parse an environment variable, falling back to a default.
fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Load the payment webhook secret from file or environment.
fn load_payment_secrets() -> Option<String> {
    // Try multiple paths for the secrets file
    let secret_paths = [
        ".secrets/payment.json",
        "arbor-credits/.secrets/payment.json",
        "../.secrets/payment.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<PaymentSecrets>(path) {
            tracing::info!(path = %path, "Loaded payment secrets from file");
            return Some(secrets.webhook_secret);
        }
    }

    // Fall back to the environment variable
    tracing::debug!("Payment secrets file not found, using environment variables");
    std::env::var("PAYMENT_WEBHOOK_SECRET").ok()
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/arbor-credits".into(),
            auth_base_url: "https://id.arbor.app".into(),
            auth_audience: "arbor-credits".into(),
            service_api_key: None,
            admin_api_key: None,
            payment_webhook_secret: None,
            frontend_url: "http://localhost:3000".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            trial_credits: 3,
            rate_limit_max_requests: 3,
            rate_limit_window_seconds: 60,
            rate_limit_retention_seconds: 120,
            lock_timeout_seconds: 5,
            generation_timeout_seconds: 300,
            sweep_interval_seconds: 60,
        }
    }
}
