//! Configuration management for the rankguard service.
//!
//! This module provides configuration loading with multiple sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! # Configuration Hierarchy
//!
//! Environment variables take precedence over config file values,
//! which take precedence over defaults.
//!
//! # Example
//!
//! ```ignore
//! use rankguard_server::config::ServiceConfig;
//!
//! // Load from file with env overrides
//! let config = ServiceConfig::load("rankguard.yaml")?;
//!
//! // Or load from environment only
//! let config = ServiceConfig::from_env()?;
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use rankguard_domain::{ConflictPolicy, DefaultPolicy, PermissionCacheConfig};
use serde::{Deserialize, Serialize};

use crate::observability::{LogFormat, LoggingConfig};
use crate::retry::RetryPolicy;

/// Environment variable prefix for every override.
pub const ENV_PREFIX: &str = "RANKGUARD";

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServiceConfig {
    /// Resolved set cache settings
    #[serde(default)]
    pub cache: CacheSettings,

    /// Resolution policy settings
    #[serde(default)]
    pub resolver: ResolverSettings,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Transient failure retry settings
    #[serde(default)]
    pub retry: RetrySettings,

    /// Timed membership sweep settings
    #[serde(default)]
    pub expiry: ExpirySettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Resolved set cache settings.
///
/// - `RANKGUARD_CACHE__ENABLED=false` - Resolve from storage on every check
/// - `RANKGUARD_CACHE__MAX_CAPACITY=50000` - Maximum cached players
/// - `RANKGUARD_CACHE__TTL_SECS=600` - Time-to-live of a cached set
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> PermissionCacheConfig {
        PermissionCacheConfig::default()
            .with_enabled(self.enabled)
            .with_max_capacity(self.max_capacity)
            .with_ttl(Duration::from_secs(self.ttl_secs))
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_cache_ttl() -> u64 {
    300
}

/// Resolution policy settings.
///
/// # Example YAML Configuration
///
/// ```yaml
/// resolver:
///   default_policy: deny
///   conflict_policy: deny_wins
///   strict_consistency: false
///   strict_timeout_ms: 50
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResolverSettings {
    /// Answer for nodes no layer mentions, and for checks that miss the cache.
    #[serde(default)]
    pub default_policy: DefaultPolicy,

    /// Tie-break between unrelated groups.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Block a cache-missing check until the load completes (bounded by
    /// `strict_timeout_ms`) instead of answering the default immediately.
    #[serde(default)]
    pub strict_consistency: bool,

    #[serde(default = "default_strict_timeout")]
    pub strict_timeout_ms: u64,

    /// Upper bound on one profile load.
    #[serde(default = "default_load_timeout")]
    pub load_timeout_ms: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            strict_consistency: false,
            strict_timeout_ms: default_strict_timeout(),
            load_timeout_ms: default_load_timeout(),
        }
    }
}

impl ResolverSettings {
    pub fn strict_timeout(&self) -> Duration {
        Duration::from_millis(self.strict_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

fn default_strict_timeout() -> u64 {
    50
}

fn default_load_timeout() -> u64 {
    5_000
}

/// Storage backend settings.
#[derive(Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageSettings {
    /// Storage backend type: "memory" or "postgres"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Database connection URL (required if backend is "postgres")
    pub database_url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Maximum concurrent storage calls
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Per-query timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

// Custom Debug implementation to hide credentials in database_url
impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("backend", &self.backend)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("pool_size", &self.pool_size)
            .field("io_workers", &self.io_workers)
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .finish()
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            database_url: None,
            pool_size: default_pool_size(),
            io_workers: default_io_workers(),
            connection_timeout_secs: default_connection_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_io_workers() -> usize {
    8
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_query_timeout() -> u64 {
    10
}

/// Retry settings for transient storage failures.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    5_000
}

/// Timed membership sweep settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExpirySettings {
    /// Seconds between sweeps of cached sets whose memberships ran out.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ExpirySettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ExpirySettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    5
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl LoggingSettings {
    /// Converts to the subscriber configuration. An unparseable level falls
    /// back to INFO; `validate` rejects those before this is reached.
    pub fn to_logging_config(&self) -> LoggingConfig {
        let level = self.level.parse().unwrap_or(tracing::Level::INFO);
        let format = if self.json {
            LogFormat::Json
        } else {
            LogFormat::Text
        };
        LoggingConfig::new(format, level)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

fn invalid(message: impl Into<String>) -> ConfigLoadError {
    ConfigLoadError::Invalid {
        message: message.into(),
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `RANKGUARD_` and use `__` as separator.
    /// For example:
    /// - `RANKGUARD_CACHE__TTL_SECS=60` overrides `cache.ttl_secs`
    /// - `RANKGUARD_STORAGE__DATABASE_URL=...` overrides `storage.database_url`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ServiceConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            // RANKGUARD_RESOLVER__DEFAULT_POLICY -> resolver.default_policy
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let service_config: ServiceConfig = config.try_deserialize()?;
        service_config.validate()?;

        Ok(service_config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServiceConfig::default())?)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let service_config: ServiceConfig = config.try_deserialize()?;
        service_config.validate()?;

        Ok(service_config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.cache.enabled && self.cache.max_capacity == 0 {
            return Err(invalid(
                "cache.max_capacity must be greater than 0 when the cache is enabled",
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs must be greater than 0"));
        }

        if self.resolver.strict_consistency && self.resolver.strict_timeout_ms == 0 {
            return Err(invalid(
                "resolver.strict_timeout_ms must be greater than 0 in strict mode",
            ));
        }
        if self.resolver.load_timeout_ms == 0 {
            return Err(invalid("resolver.load_timeout_ms must be greater than 0"));
        }

        let valid_backends = ["memory", "postgres"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(invalid(format!(
                "storage.backend must be one of: {:?}, got: {}",
                valid_backends, self.storage.backend
            )));
        }
        if self.storage.backend == "postgres"
            && self
                .storage
                .database_url
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            return Err(invalid(
                "storage.database_url is required when backend is 'postgres'",
            ));
        }
        if self.storage.pool_size == 0 {
            return Err(invalid("storage.pool_size must be greater than 0"));
        }
        if self.storage.io_workers == 0 {
            return Err(invalid("storage.io_workers must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(format!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        if self.expiry.sweep_interval_secs == 0 {
            return Err(invalid("expiry.sweep_interval_secs must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "logging.level must be one of: {:?}, got: {}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Test: Can load config from YAML file
    #[test]
    #[serial]
    fn test_can_load_config_from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
cache:
  max_capacity: 500
  ttl_secs: 60

resolver:
  default_policy: allow
  conflict_policy: allow_wins
  strict_consistency: true
  strict_timeout_ms: 25

storage:
  backend: memory
  io_workers: 4

retry:
  max_attempts: 3

expiry:
  sweep_interval_secs: 10

logging:
  level: debug
  json: true
"#
        )
        .unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();

        assert_eq!(config.cache.max_capacity, 500);
        assert_eq!(config.cache.ttl_secs, 60);
        assert!(config.cache.enabled);
        assert_eq!(config.resolver.default_policy, DefaultPolicy::Allow);
        assert_eq!(config.resolver.conflict_policy, ConflictPolicy::AllowWins);
        assert!(config.resolver.strict_consistency);
        assert_eq!(config.resolver.strict_timeout(), Duration::from_millis(25));
        assert_eq!(config.storage.io_workers, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.expiry.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    /// Test: Can override config with env vars
    #[test]
    #[serial]
    fn test_can_override_config_with_env_vars() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
cache:
  ttl_secs: 60

storage:
  backend: memory
"#
        )
        .unwrap();

        std::env::set_var("RANKGUARD_CACHE__TTL_SECS", "120");
        std::env::set_var("RANKGUARD_RESOLVER__DEFAULT_POLICY", "allow");

        let config = ServiceConfig::load(file.path());

        std::env::remove_var("RANKGUARD_CACHE__TTL_SECS");
        std::env::remove_var("RANKGUARD_RESOLVER__DEFAULT_POLICY");

        let config = config.unwrap();
        assert_eq!(config.cache.ttl_secs, 120); // Overridden by env
        assert_eq!(config.storage.backend, "memory"); // From file
        assert_eq!(config.resolver.default_policy, DefaultPolicy::Allow);
    }

    /// Test: Config validation catches errors
    #[test]
    fn test_config_validation_catches_errors() {
        let cases: Vec<(fn(&mut ServiceConfig), &str)> = vec![
            (|c| c.storage.backend = "rocksdb".into(), "storage.backend"),
            (|c| c.storage.backend = "postgres".into(), "database_url"),
            (
                |c| {
                    c.storage.backend = "postgres".into();
                    c.storage.database_url = Some("   ".into());
                },
                "database_url",
            ),
            (|c| c.storage.io_workers = 0, "io_workers"),
            (|c| c.cache.max_capacity = 0, "cache.max_capacity"),
            (|c| c.cache.ttl_secs = 0, "cache.ttl_secs"),
            (
                |c| {
                    c.resolver.strict_consistency = true;
                    c.resolver.strict_timeout_ms = 0;
                },
                "strict_timeout_ms",
            ),
            (|c| c.retry.max_attempts = 0, "retry.max_attempts"),
            (|c| c.retry.base_delay_ms = 10_000, "retry.base_delay_ms"),
            (|c| c.expiry.sweep_interval_secs = 0, "sweep_interval_secs"),
            (|c| c.logging.level = "verbose".into(), "logging.level"),
        ];

        for (mutate, expected) in cases {
            let mut config = ServiceConfig::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "expected '{expected}' in: {err}"
            );
        }
    }

    /// Test: Disabled cache accepts zero capacity
    #[test]
    fn test_disabled_cache_skips_capacity_check() {
        let mut config = ServiceConfig::default();
        config.cache.enabled = false;
        config.cache.max_capacity = 0;
        assert!(config.validate().is_ok());
    }

    /// Test: Invalid config returns clear error
    #[test]
    fn test_invalid_config_returns_clear_error() {
        let result = ServiceConfig::load("/nonexistent/path/rankguard.yaml");
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigLoadError::FileNotFound { .. }));
        assert!(err.to_string().contains("not found"));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: syntax: [").unwrap();
        let err = ServiceConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Load(_)));
    }

    /// Test: Unknown policy names are rejected at load time
    #[test]
    #[serial]
    fn test_unknown_policy_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "resolver:\n  conflict_policy: coin_flip").unwrap();
        let err = ServiceConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Load(_)));
    }

    /// Test: Default config is valid
    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.resolver.default_policy, DefaultPolicy::Deny);
        assert_eq!(config.resolver.conflict_policy, ConflictPolicy::DenyWins);
        assert!(!config.resolver.strict_consistency);
        assert_eq!(config.expiry.sweep_interval_secs, 5);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    /// Test: from_env loads defaults with env overrides
    #[test]
    #[serial]
    fn test_from_env_loads_defaults_with_env_overrides() {
        std::env::set_var("RANKGUARD_STORAGE__IO_WORKERS", "2");

        let config = ServiceConfig::from_env();

        std::env::remove_var("RANKGUARD_STORAGE__IO_WORKERS");

        let config = config.unwrap();
        assert_eq!(config.storage.io_workers, 2);
        assert_eq!(config.storage.pool_size, 10); // default
    }

    #[test]
    fn test_storage_debug_redacts_database_url() {
        let mut config = ServiceConfig::default();
        config.storage.database_url = Some("postgres://admin:hunter2@db/rankguard".into());
        let debug = format!("{:?}", config.storage);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_settings_convert_to_runtime_types() {
        let config = ServiceConfig::default();
        let cache = config.cache.to_cache_config();
        assert_eq!(cache.ttl, Duration::from_secs(300));
        assert_eq!(config.retry.to_policy().max_attempts, 5);
        assert_eq!(
            config.logging.to_logging_config(),
            LoggingConfig::new(LogFormat::Text, tracing::Level::INFO)
        );
    }
}
