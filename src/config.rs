//! Environment-driven configuration for the store backend, index job and attribution service

use crate::attribution::confidence::ConfidenceWeights;
use crate::attribution::journey::DEFAULT_LOOKBACK_HOURS;
use crate::attribution::query::DEFAULT_WINDOW_HOURS;
use crate::pipeline::job::JobSettings;
use crate::store::{KvStore, MemoryStore, RestStore, SqliteStore, StoreError};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendType {
    Rest,
    Sqlite,
    Memory,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime configuration for the index job and the attribution service
#[derive(Debug, Clone)]
pub struct AttribConfig {
    pub backend: BackendType,
    pub rest_url: Option<String>,
    pub rest_token: Option<String>,
    pub sqlite_path: String,
    pub request_timeout: Duration,

    /// Index job tunables
    pub job: JobSettings,

    pub weights: ConfidenceWeights,
    /// Attribution window when the request does not name one
    pub default_window_hours: i64,
    pub journey_lookback_hours: i64,
    pub journey_cache_ttl: Duration,
}

impl AttribConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `STORE_BACKEND` (rest | sqlite | memory, default: rest)
    /// - `KV_REST_API_URL`, `KV_REST_API_TOKEN` (required for rest)
    /// - `ATTRIB_DB_PATH` (default: attribflow.db)
    /// - `STORE_TIMEOUT_MS` (default: 10000)
    /// - `INDEX_JOB_NAME` (default: pageview-index)
    /// - `SCAN_PATTERN` (default: pageview:*)
    /// - `SCAN_COUNT` (default: 200), `FETCH_BATCH_SIZE` (default: 50),
    ///   `WRITE_BATCH_SIZE` (default: 25)
    /// - `MAX_SCAN_ITERATIONS` (default: 25 per round), `MAX_ROUNDS` (default: 40)
    /// - `JOB_BUDGET_MS` (default: 55000), `SAFETY_MARGIN_MS` (default: 5000)
    /// - `SCAN_SHARE` (default: 0.5)
    /// - `INDEX_TTL_DAYS` (default: 30), `LOOKUP_CAP` (default: 100)
    /// - `PROGRESS_TTL_DAYS` (default: unset, no expiry)
    /// - `RESTART_WHEN_COMPLETE` (default: false)
    /// - `ATTRIBUTION_WINDOW_HOURS` (default: 24)
    /// - `JOURNEY_LOOKBACK_HOURS` (default: 168)
    /// - `JOURNEY_CACHE_TTL_SECS` (default: 3600)
    /// - `CONFIDENCE_*` weights, see [`ConfidenceWeights::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_str = env::var("STORE_BACKEND").unwrap_or_else(|_| "rest".to_string());
        let backend = match backend_str.trim().to_lowercase().as_str() {
            "rest" => BackendType::Rest,
            "sqlite" => BackendType::Sqlite,
            "memory" => BackendType::Memory,
            _ => {
                return Err(ConfigError::InvalidValue(format!(
                    "STORE_BACKEND must be rest, sqlite or memory, got '{}'",
                    backend_str
                )))
            }
        };

        let rest_url = env::var("KV_REST_API_URL").ok().filter(|s| !s.trim().is_empty());
        let rest_token = env::var("KV_REST_API_TOKEN").ok().filter(|s| !s.trim().is_empty());

        let defaults = JobSettings::default();
        let job = JobSettings {
            job_name: env::var("INDEX_JOB_NAME").unwrap_or(defaults.job_name),
            scan_pattern: env::var("SCAN_PATTERN").unwrap_or(defaults.scan_pattern),
            scan_count: parse_or("SCAN_COUNT", defaults.scan_count),
            fetch_batch_size: parse_or("FETCH_BATCH_SIZE", defaults.fetch_batch_size),
            write_batch_size: parse_or("WRITE_BATCH_SIZE", defaults.write_batch_size),
            max_scan_iterations: parse_or("MAX_SCAN_ITERATIONS", defaults.max_scan_iterations),
            max_rounds: parse_or("MAX_ROUNDS", defaults.max_rounds),
            budget: Duration::from_millis(parse_or("JOB_BUDGET_MS", defaults.budget.as_millis() as u64)),
            safety_margin: Duration::from_millis(parse_or(
                "SAFETY_MARGIN_MS",
                defaults.safety_margin.as_millis() as u64,
            )),
            scan_share: parse_or("SCAN_SHARE", defaults.scan_share),
            index_ttl_days: parse_or("INDEX_TTL_DAYS", defaults.index_ttl_days),
            lookup_cap: parse_or("LOOKUP_CAP", defaults.lookup_cap),
            progress_ttl: env::var("PROGRESS_TTL_DAYS")
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|days| Duration::from_secs(days * 86_400)),
            restart_when_complete: parse_or("RESTART_WHEN_COMPLETE", defaults.restart_when_complete),
        };

        let config = Self {
            backend,
            rest_url,
            rest_token,
            sqlite_path: env::var("ATTRIB_DB_PATH").unwrap_or_else(|_| "attribflow.db".to_string()),
            request_timeout: Duration::from_millis(parse_or("STORE_TIMEOUT_MS", 10_000u64)),
            job,
            weights: ConfidenceWeights::from_env(),
            default_window_hours: parse_or("ATTRIBUTION_WINDOW_HOURS", DEFAULT_WINDOW_HOURS),
            journey_lookback_hours: parse_or("JOURNEY_LOOKBACK_HOURS", DEFAULT_LOOKBACK_HOURS),
            journey_cache_ttl: Duration::from_secs(parse_or("JOURNEY_CACHE_TTL_SECS", 3_600u64)),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == BackendType::Rest {
            let url = self
                .rest_url
                .as_deref()
                .ok_or_else(|| ConfigError::MissingVariable("KV_REST_API_URL".to_string()))?;
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "KV_REST_API_URL must start with http:// or https://".to_string(),
                ));
            }
            if self.rest_token.is_none() {
                return Err(ConfigError::MissingVariable("KV_REST_API_TOKEN".to_string()));
            }
        }
        if self.default_window_hours <= 0 || self.journey_lookback_hours <= 0 {
            return Err(ConfigError::InvalidValue(
                "attribution window and journey lookback must be positive".to_string(),
            ));
        }
        self.job.validate()
    }

    /// Connect the configured backend
    pub fn open_store(&self) -> Result<Arc<dyn KvStore>, StoreError> {
        let store: Arc<dyn KvStore> = match self.backend {
            BackendType::Rest => {
                let url = self.rest_url.as_deref().unwrap_or_default();
                let token = self.rest_token.as_deref().unwrap_or_default();
                Arc::new(RestStore::new(url, token, self.request_timeout)?)
            }
            BackendType::Sqlite => Arc::new(SqliteStore::open(&self.sqlite_path)?),
            BackendType::Memory => Arc::new(MemoryStore::new()),
        };
        log::info!("🔌 Store backend: {}", store.backend_type());
        Ok(store)
    }
}

/// Parse an env var, falling back to `default` (with a warning) when invalid
fn parse_or<T: FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("Invalid {} '{}', defaulting to {}", name, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}
