//! Service configuration.

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use avatarbank_core::{PricingConfig, PricingRule, DEFAULT_BASE_CREDITS};

/// Default fal.ai synchronous endpoint base.
pub const DEFAULT_FAL_API_BASE_URL: &str = "https://fal.run";

/// Default fal.ai queue endpoint base.
pub const DEFAULT_FAL_QUEUE_BASE_URL: &str = "https://fal.run";

/// Default fal.ai model path.
pub const DEFAULT_FAL_MODEL: &str = "fal-ai/z-image/turbo";

/// Which storage backend the service runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local, lost on restart.
    Memory,
    /// Embedded `RocksDB` under `data_dir`.
    RocksDb,
    /// PostgreSQL at `database_url`.
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// How a submitted generation reaches the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Call the provider inside the submitting request.
    Sync,
    /// Create a task and hand it to a worker.
    Async,
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("unknown generation mode: {other}")),
        }
    }
}

/// Admin whitelist.
///
/// An authenticated user is an admin when their email, compared
/// case-insensitively, is in the whitelist.
#[derive(Debug, Clone, Default)]
pub struct AdminConfig {
    /// Lowercased admin emails.
    pub whitelist: BTreeSet<String>,
}

impl AdminConfig {
    /// Build from a comma-separated list of emails.
    #[must_use]
    pub fn from_list(list: &str) -> Self {
        Self {
            whitelist: list
                .split(',')
                .map(|email| email.trim().to_lowercase())
                .filter(|email| !email.is_empty())
                .collect(),
        }
    }

    /// Whether `email` belongs to an admin.
    #[must_use]
    pub fn is_admin(&self, email: &str) -> bool {
        self.whitelist.contains(&email.trim().to_lowercase())
    }
}

/// Image provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// fal.ai API key. Calls fail when unset.
    pub fal_api_key: Option<String>,

    /// Base URL for synchronous calls.
    pub fal_api_base_url: String,

    /// Base URL for queue submission and polling.
    pub fal_queue_base_url: String,

    /// Model path appended to the base URLs.
    pub fal_model: String,

    /// Upper bound on a single provider call, in seconds.
    pub timeout_seconds: u64,

    /// Delay between queue polls, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            fal_api_key: None,
            fal_api_base_url: DEFAULT_FAL_API_BASE_URL.into(),
            fal_queue_base_url: DEFAULT_FAL_QUEUE_BASE_URL.into(),
            fal_model: DEFAULT_FAL_MODEL.into(),
            timeout_seconds: 120,
            poll_interval_ms: 1000,
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Storage backend (default: memory).
    pub store_backend: StoreBackend,

    /// Path to `RocksDB` data directory (default: "/data/avatarbank").
    pub data_dir: String,

    /// PostgreSQL connection string.
    pub database_url: Option<String>,

    /// HMAC secret for user JWTs.
    pub jwt_secret_key: String,

    /// JWT signing algorithm name (default: "HS256").
    pub jwt_algorithm: String,

    /// Shared secret for worker callback signatures. Worker routes reject
    /// every request when unset.
    pub worker_hmac_secret: Option<String>,

    /// Admin whitelist.
    pub admin: AdminConfig,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Pricing configuration.
    pub pricing: PricingConfig,

    /// Inline or queued generation.
    pub generation_mode: GenerationMode,

    /// Image provider settings.
    pub provider: ProviderConfig,

    /// In-process workers draining the task queue (async mode).
    pub worker_count: usize,

    /// Extra attempts a failed task gets before its generation fails.
    pub max_task_retries: u32,

    /// Age after which an unsettled generation is considered stale.
    pub stale_after_seconds: u64,

    /// Period of the background stale sweep. Disabled when unset.
    pub sweep_interval_seconds: Option<u64>,

    /// Directory for uploaded media.
    pub media_dir: String,

    /// Public URL prefix for uploaded media.
    pub media_base_url: String,
}

/// fal.ai secrets file structure.
#[derive(Debug, Deserialize)]
struct FalSecrets {
    api_key: String,
    #[serde(default)]
    api_base_url: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Configuration rejected at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("invalid {key}: {reason}")]
    Invalid {
        /// Environment variable name.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the loaded values fail [`Self::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let provider = load_provider_config();

        let pricing = PricingConfig {
            rule: env_parse::<PricingRule>("PRICING_RULE").unwrap_or_default(),
            base_credits: env_parse("BASE_CREDITS").unwrap_or(DEFAULT_BASE_CREDITS),
        };

        let config = Self {
            listen_addr: env_or("LISTEN_ADDR", &defaults.listen_addr),
            store_backend: env_parse("STORE_BACKEND").unwrap_or(defaults.store_backend),
            data_dir: env_or("DATA_DIR", &defaults.data_dir),
            database_url: std::env::var("DATABASE_URL").ok(),
            jwt_secret_key: env_or("JWT_SECRET_KEY", &defaults.jwt_secret_key),
            jwt_algorithm: env_or("JWT_ALGORITHM", &defaults.jwt_algorithm),
            worker_hmac_secret: std::env::var("WORKER_HMAC_SECRET").ok(),
            admin: AdminConfig::from_list(&env_or("ADMIN_EMAIL_WHITELIST", "")),
            cors_origins: env_or("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_seconds),
            pricing,
            generation_mode: env_parse("GENERATION_MODE").unwrap_or(defaults.generation_mode),
            provider,
            worker_count: env_parse("WORKER_COUNT")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.worker_count),
            max_task_retries: env_parse("MAX_TASK_RETRIES").unwrap_or(0),
            stale_after_seconds: env_parse("STALE_AFTER_SECONDS")
                .unwrap_or(defaults.stale_after_seconds),
            sweep_interval_seconds: env_parse("SWEEP_INTERVAL_SECONDS").filter(|s| *s > 0),
            media_dir: env_or("MEDIA_DIR", &defaults.media_dir),
            media_base_url: env_or("MEDIA_BASE_URL", &defaults.media_base_url),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// Every generation costs at least one credit, and a synchronous request
    /// must outlive the provider call it waits on.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pricing.base_credits < 1 {
            return Err(ConfigError::Invalid {
                key: "BASE_CREDITS",
                reason: format!("must be at least 1, got {}", self.pricing.base_credits),
            });
        }
        if self.request_timeout_seconds <= self.provider.timeout_seconds {
            return Err(ConfigError::Invalid {
                key: "REQUEST_TIMEOUT_SECONDS",
                reason: format!(
                    "must exceed PROVIDER_TIMEOUT_SECONDS ({}), got {}",
                    self.provider.timeout_seconds, self.request_timeout_seconds
                ),
            });
        }
        Ok(())
    }
}

/// Load provider settings, preferring the fal secrets file for credentials.
fn load_provider_config() -> ProviderConfig {
    let defaults = ProviderConfig::default();
    let (fal_api_key, file_base_url, file_model) = load_fal_secrets();

    ProviderConfig {
        fal_api_key,
        fal_api_base_url: file_base_url
            .unwrap_or_else(|| env_or("FAL_API_BASE_URL", &defaults.fal_api_base_url)),
        fal_queue_base_url: env_or("FAL_QUEUE_BASE_URL", &defaults.fal_queue_base_url),
        fal_model: file_model.unwrap_or_else(|| env_or("FAL_MODEL", &defaults.fal_model)),
        timeout_seconds: env_parse("PROVIDER_TIMEOUT_SECONDS")
            .filter(|s| *s > 0)
            .unwrap_or(defaults.timeout_seconds),
        poll_interval_ms: env_parse("PROVIDER_POLL_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .unwrap_or(defaults.poll_interval_ms),
    }
}

/// Load fal.ai secrets from file or environment.
fn load_fal_secrets() -> (Option<String>, Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/fal.json",
        "avatarbank/.secrets/fal.json",
        "avatarbank/service/.secrets/fal.json",
        "../.secrets/fal.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<FalSecrets>(path) {
            tracing::info!(path = %path, "Loaded fal secrets from file");
            return (Some(secrets.api_key), secrets.api_base_url, secrets.model);
        }
    }

    tracing::debug!("fal secrets file not found, using environment variables");
    (
        std::env::var("FAL_API_KEY").ok().filter(|k| !k.is_empty()),
        None,
        None,
    )
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
            store_backend: StoreBackend::Memory,
            data_dir: "/data/avatarbank".into(),
            database_url: None,
            jwt_secret_key: "change-me".into(),
            jwt_algorithm: "HS256".into(),
            worker_hmac_secret: None,
            admin: AdminConfig::default(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 10 * 1024 * 1024,
            request_timeout_seconds: 180,
            pricing: PricingConfig::default(),
            generation_mode: GenerationMode::Sync,
            provider: ProviderConfig::default(),
            worker_count: 4,
            max_task_retries: 0,
            stale_after_seconds: 900,
            sweep_interval_seconds: None,
            media_dir: "./media".into(),
            media_base_url: "/media".into(),
        }
    }
}
