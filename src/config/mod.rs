//! Configuration loading for the authorization proxy.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `AUTHPROXY_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "AUTHPROXY_";

/// Application configuration derived from `AUTHPROXY_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    /// Public origin of this proxy; redirect and callback URLs are built from it
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default)]
    pub ephemeral_backend: EphemeralBackend,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
}

/// Where OAuth2 state records and mutex leases live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EphemeralBackend {
    /// Shared table in the primary database; safe across worker processes
    #[default]
    Database,
    /// Process-local map; only for single-process deployments and tests
    Memory,
}

impl FromStr for EphemeralBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(Self::Database),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::InvalidEphemeralBackend {
                value: value.to_string(),
            }),
        }
    }
}

/// OAuth2 authorization round-trip settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OAuthConfig {
    /// TTL of an issued OAuth2 state record (default: 600)
    #[serde(default = "default_oauth_round_trip_timeout_seconds")]
    pub round_trip_timeout_seconds: u64,

    /// Lifetime of the self-signed redirect bearer token (default: 300)
    #[serde(default = "default_oauth_redirect_token_ttl_seconds")]
    pub redirect_token_ttl_seconds: u64,

    /// Refresh lock duration and retry budget when a connector sets none (default: 30)
    #[serde(default = "default_oauth_refresh_timeout_seconds")]
    pub refresh_timeout_seconds: u64,
}

impl OAuthConfig {
    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_secs(self.round_trip_timeout_seconds)
    }

    pub fn redirect_token_ttl(&self) -> Duration {
        Duration::from_secs(self.redirect_token_ttl_seconds)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(60..=3600).contains(&self.round_trip_timeout_seconds) {
            return Err(ConfigError::InvalidOAuthRoundTripTimeout {
                value: self.round_trip_timeout_seconds,
            });
        }

        if self.redirect_token_ttl_seconds == 0
            || self.redirect_token_ttl_seconds > self.round_trip_timeout_seconds
        {
            return Err(ConfigError::InvalidRedirectTokenTtl {
                value: self.redirect_token_ttl_seconds,
                max_allowed: self.round_trip_timeout_seconds,
            });
        }

        if !(1..=300).contains(&self.refresh_timeout_seconds) {
            return Err(ConfigError::InvalidRefreshTimeout {
                value: self.refresh_timeout_seconds,
            });
        }

        Ok(())
    }
}

/// Background token refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cron expression for the sweep; five-field expressions are accepted
    #[serde(default = "default_token_refresh_cron")]
    pub cron: String,

    /// Global refresh-before-expiry window in seconds (default: 600)
    #[serde(default = "default_token_refresh_before_expiry_seconds")]
    pub before_expiry_seconds: u64,

    /// Number of queued tasks executed concurrently (default: 4)
    #[serde(default = "default_token_refresh_workers")]
    pub workers: u32,

    /// Cron expression for purging spent redirect-token nonces
    #[serde(default = "default_nonce_purge_cron")]
    pub nonce_purge_cron: String,
}

impl TokenRefreshConfig {
    pub fn before_expiry(&self) -> Duration {
        Duration::from_secs(self.before_expiry_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for expr in [&self.cron, &self.nonce_purge_cron] {
            if let Err(error) = cron::Schedule::from_str(&normalize_cron_expr(expr)) {
                return Err(ConfigError::InvalidCronExpression {
                    value: expr.clone(),
                    error: error.to_string(),
                });
            }
        }

        if self.before_expiry_seconds < 60 || self.before_expiry_seconds > 86400 {
            return Err(ConfigError::InvalidRefreshBeforeExpiry {
                value: self.before_expiry_seconds,
            });
        }

        if self.workers == 0 || self.workers > 64 {
            return Err(ConfigError::InvalidRefreshWorkers {
                value: self.workers,
            });
        }

        Ok(())
    }
}

/// Accepts standard five-field cron by prepending a seconds field.
pub fn normalize_cron_expr(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            public_base_url: default_public_base_url(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            crypto_key: None,
            ephemeral_backend: EphemeralBackend::default(),
            oauth: OAuthConfig::default(),
            token_refresh: TokenRefreshConfig::default(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            round_trip_timeout_seconds: default_oauth_round_trip_timeout_seconds(),
            redirect_token_ttl_seconds: default_oauth_redirect_token_ttl_seconds(),
            refresh_timeout_seconds: default_oauth_refresh_timeout_seconds(),
        }
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: default_token_refresh_cron(),
            before_expiry_seconds: default_token_refresh_before_expiry_seconds(),
            workers: default_token_refresh_workers(),
            nonce_purge_cron: default_nonce_purge_cron(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    pub fn public_base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.public_base_url).map_err(|error| ConfigError::InvalidPublicBaseUrl {
            value: self.public_base_url.clone(),
            error: error.to_string(),
        })
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        if let Some(at) = config.database_url.find('@') {
            config.database_url = format!("[REDACTED]{}", &config.database_url[at..]);
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        let public = self.public_base_url()?;
        if !matches!(public.scheme(), "http" | "https") || public.cannot_be_a_base() {
            return Err(ConfigError::InvalidPublicBaseUrl {
                value: self.public_base_url.clone(),
                error: "must be an absolute http(s) URL".to_string(),
            });
        }
        if public.scheme() == "http" && !matches!(self.profile.as_str(), "local" | "test") {
            return Err(ConfigError::InsecurePublicBaseUrl {
                profile: self.profile.clone(),
            });
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.oauth.validate()?;
        self.token_refresh.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/authproxy".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_oauth_round_trip_timeout_seconds() -> u64 {
    600 // 10 minutes
}

fn default_oauth_redirect_token_ttl_seconds() -> u64 {
    300 // 5 minutes
}

fn default_oauth_refresh_timeout_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_token_refresh_cron() -> String {
    "0 */10 * * * *".to_string() // every 10 minutes
}

fn default_token_refresh_before_expiry_seconds() -> u64 {
    600 // 10 minutes
}

fn default_token_refresh_workers() -> u32 {
    4
}

fn default_nonce_purge_cron() -> String {
    "0 0 * * * *".to_string() // hourly
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("crypto key is missing; set AUTHPROXY_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("public base URL '{value}' is invalid: {error}")]
    InvalidPublicBaseUrl { value: String, error: String },
    #[error("public base URL must use https outside local/test profiles (profile: {profile})")]
    InsecurePublicBaseUrl { profile: String },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("ephemeral backend must be 'database' or 'memory', got '{value}'")]
    InvalidEphemeralBackend { value: String },
    #[error("OAuth round-trip timeout must be between 60 and 3600 seconds, got {value}")]
    InvalidOAuthRoundTripTimeout { value: u64 },
    #[error(
        "OAuth redirect token TTL must be positive and not exceed the round-trip timeout ({max_allowed}), got {value}"
    )]
    InvalidRedirectTokenTtl { value: u64, max_allowed: u64 },
    #[error("OAuth refresh timeout must be between 1 and 300 seconds, got {value}")]
    InvalidRefreshTimeout { value: u64 },
    #[error("invalid cron expression '{value}': {error}")]
    InvalidCronExpression { value: String, error: String },
    #[error("token refresh window must be between 60 and 86400 seconds, got {value}")]
    InvalidRefreshBeforeExpiry { value: u64 },
    #[error("token refresh workers must be between 1 and 64, got {value}")]
    InvalidRefreshWorkers { value: u32 },
}

/// Loads configuration using layered `.env` files and `AUTHPROXY_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration. Later layers win:
    /// `.env` < `.env.local` < `.env.<profile>` < `.env.<profile>.local` < process env.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        Self::from_layered(layered, profile_hint)
    }

    fn from_layered(
        mut layered: BTreeMap<String, String>,
        profile_hint: String,
    ) -> Result<AppConfig, ConfigError> {
        let mut take = |key: &str| layered.remove(key).filter(|v| !v.trim().is_empty());

        let profile = take("PROFILE").unwrap_or(profile_hint);
        let api_bind_addr = take("API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let public_base_url = take("PUBLIC_BASE_URL").unwrap_or_else(default_public_base_url);
        let log_level = take("LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take("LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url = take("DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let crypto_key = match take("CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let ephemeral_backend = match take("EPHEMERAL_BACKEND") {
            Some(value) => value.parse()?,
            None => EphemeralBackend::default(),
        };

        let oauth = OAuthConfig {
            round_trip_timeout_seconds: take("OAUTH_ROUND_TRIP_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_oauth_round_trip_timeout_seconds),
            redirect_token_ttl_seconds: take("OAUTH_REDIRECT_TOKEN_TTL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_oauth_redirect_token_ttl_seconds),
            refresh_timeout_seconds: take("OAUTH_REFRESH_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_oauth_refresh_timeout_seconds),
        };

        let token_refresh = TokenRefreshConfig {
            enabled: take("TOKEN_REFRESH_ENABLED")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(true),
            cron: take("TOKEN_REFRESH_CRON").unwrap_or_else(default_token_refresh_cron),
            before_expiry_seconds: take("TOKEN_REFRESH_BEFORE_EXPIRY_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_token_refresh_before_expiry_seconds),
            workers: take("TOKEN_REFRESH_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_token_refresh_workers),
            nonce_purge_cron: take("NONCE_PURGE_CRON").unwrap_or_else(default_nonce_purge_cron),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            public_base_url,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            crypto_key,
            ephemeral_backend,
            oauth,
            token_refresh,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{}PROFILE", ENV_PREFIX))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
