//! Gateway configuration from environment variables.
//!
//! - `ADMIN_TOKEN` - Optional. Admin login secret for the management surface.
//! - `DSN` - Optional. Path of the sqlite configuration/outcome store. Defaults to `cch.db`.
//! - `REDIS_URL` - Optional. Shared-store address (`redis://` or `rediss://`). Unset = in-process store.
//! - `REDIS_TLS_REJECT_UNAUTHORIZED` - Optional. Validate the TLS certificate. Defaults to `true`.
//! - `ENABLE_RATE_LIMIT` - Optional. Master switch for all limit checks. Defaults to `true`.
//! - `ENABLE_CIRCUIT_BREAKER_ON_NETWORK_ERRORS` - Optional. Count network errors as breaker failures. Defaults to `false`.
//! - `SESSION_TTL` - Optional. Session inactivity TTL in seconds. Defaults to `300`.
//! - `STORE_SESSION_MESSAGES` - Optional. Persist request/response bodies. Defaults to `false`.
//! - `AUTO_MIGRATE` - Optional. Create/upgrade the sqlite schema on boot. Defaults to `true`.
//! - `APP_PORT` / `APP_URL` - Optional. Listen port (default `3000`) and public URL.
//! - `MESSAGE_REQUEST_WRITE_MODE` - Optional. `async` or `sync` outcome writes. Defaults to `async`.
//! - `MESSAGE_REQUEST_ASYNC_FLUSH_INTERVAL_MS` / `_ASYNC_BATCH_SIZE` / `_ASYNC_MAX_PENDING` - Optional sink tuning.
//! - `DB_POOL_MAX` / `DB_POOL_IDLE_TIMEOUT` / `DB_POOL_CONNECT_TIMEOUT` - Optional store tuning; connect timeout maps to the sqlite busy timeout.
//! - `API_TEST_TIMEOUT_MS` - Optional. Provider health-probe timeout. Defaults to `10000`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How `RequestOutcome` rows reach the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Batched background writer; enqueue never blocks the request path.
    Async,
    /// Write inline and wait for durability.
    Sync,
}

/// Usage-sink tuning.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub write_mode: WriteMode,
    pub flush_interval_ms: u64,
    pub batch_size: usize,
    pub max_pending: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::Async,
            flush_interval_ms: 250,
            batch_size: 200,
            max_pending: 5000,
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin login secret (None disables the admin surface).
    pub admin_token: Option<String>,

    /// Path of the sqlite configuration/outcome store.
    pub dsn: PathBuf,

    /// Shared-store address; None runs the in-process store.
    pub redis_url: Option<String>,

    /// Whether to validate the shared store's TLS certificate.
    pub redis_tls_reject_unauthorized: bool,

    /// Master switch for rate limiting.
    pub enable_rate_limit: bool,

    /// Whether network errors trip the circuit breaker.
    pub breaker_on_network_errors: bool,

    /// Session inactivity TTL in seconds.
    pub session_ttl_secs: u64,

    /// Persist request/response bodies alongside sessions.
    pub store_session_messages: bool,

    /// Create/upgrade the sqlite schema on boot.
    pub auto_migrate: bool,

    /// Listen port.
    pub port: u16,

    /// Public URL, if the gateway sits behind a fronting proxy.
    pub app_url: Option<String>,

    /// Usage-sink tuning.
    pub sink: SinkConfig,

    /// Sqlite busy timeout, from `DB_POOL_CONNECT_TIMEOUT` (ms).
    pub db_busy_timeout_ms: u64,

    /// Provider health-probe timeout (ms).
    pub api_test_timeout_ms: u64,
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue(
                name.to_string(),
                format!("expected boolean, got {other:?}"),
            )),
        },
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let write_mode = match std::env::var("MESSAGE_REQUEST_WRITE_MODE") {
            Err(_) => WriteMode::Async,
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "async" => WriteMode::Async,
                "sync" => WriteMode::Sync,
                other => {
                    return Err(ConfigError::InvalidValue(
                        "MESSAGE_REQUEST_WRITE_MODE".to_string(),
                        format!("expected async|sync, got {other:?}"),
                    ))
                }
            },
        };

        let sink = SinkConfig {
            write_mode,
            flush_interval_ms: env_parse("MESSAGE_REQUEST_ASYNC_FLUSH_INTERVAL_MS", 250)?,
            batch_size: env_parse("MESSAGE_REQUEST_ASYNC_BATCH_SIZE", 200usize)?,
            max_pending: env_parse("MESSAGE_REQUEST_ASYNC_MAX_PENDING", 5000usize)?,
        };

        Ok(Self {
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            dsn: std::env::var("DSN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cch.db")),
            redis_url: std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty()),
            redis_tls_reject_unauthorized: env_bool("REDIS_TLS_REJECT_UNAUTHORIZED", true)?,
            enable_rate_limit: env_bool("ENABLE_RATE_LIMIT", true)?,
            breaker_on_network_errors: env_bool(
                "ENABLE_CIRCUIT_BREAKER_ON_NETWORK_ERRORS",
                false,
            )?,
            session_ttl_secs: env_parse("SESSION_TTL", 300u64)?,
            store_session_messages: env_bool("STORE_SESSION_MESSAGES", false)?,
            auto_migrate: env_bool("AUTO_MIGRATE", true)?,
            port: env_parse("APP_PORT", 3000u16)?,
            app_url: std::env::var("APP_URL").ok().filter(|u| !u.is_empty()),
            sink,
            db_busy_timeout_ms: env_parse("DB_POOL_CONNECT_TIMEOUT", 5000u64)?,
            api_test_timeout_ms: env_parse("API_TEST_TIMEOUT_MS", 10_000u64)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_token: None,
            dsn: PathBuf::from("cch.db"),
            redis_url: None,
            redis_tls_reject_unauthorized: true,
            enable_rate_limit: true,
            breaker_on_network_errors: false,
            session_ttl_secs: 300,
            store_session_messages: false,
            auto_migrate: true,
            port: 3000,
            app_url: None,
            sink: SinkConfig::default(),
            db_busy_timeout_ms: 5000,
            api_test_timeout_ms: 10_000,
        }
    }
}
