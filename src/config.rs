//! Configuration management for Ratekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{IdentityPolicy, ProfileSet, RateLimitConfig};

/// Prefix for environment variable overrides, e.g.
/// `RATEKEEPER__STORE__REDIS_URL=redis://cache:6379`.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Identifier derivation
    #[serde(default)]
    pub identity: IdentityPolicy,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Profiles added to or replacing the built-in ones
    #[serde(default)]
    pub profiles: HashMap<String, RateLimitConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Counters kept in this process only
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Budget for one limiter store call in milliseconds; slower calls fail open
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the in-memory store drops expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval() -> u64 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatekeeperConfig {
    /// Load configuration from an optional YAML file, with `RATEKEEPER__*`
    /// environment variables layered on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }
        let config: RatekeeperConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The built-in profiles merged with the configured ones.
    pub fn profile_set(&self) -> Result<ProfileSet> {
        ProfileSet::builtin().with_overrides(self.profiles.clone())
    }

    fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(RatekeeperError::Config(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(RatekeeperError::Config(
                "store.sweep_interval_secs must be positive".to_string(),
            ));
        }
        self.profile_set().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RatekeeperConfig::default();
        assert_eq!(config.server.grpc_addr, "127.0.0.1:8081".parse().unwrap());
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.identity.session_cookie, "session_id");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = RatekeeperConfig::from_yaml("{}").unwrap();
        assert_eq!(config.store.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.profile_set().unwrap().len(), 5);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  grpc_addr: 0.0.0.0:9000
store:
  backend: redis
  redis_url: redis://cache:6379/2
  timeout_ms: 100
identity:
  session_cookie: sid
  normalize_ipv6: true
logging:
  level: debug
  format: json
profiles:
  search:
    max_requests: 120
    window_seconds: 60
    key_prefix: ratelimit:search
  newsletter:
    max_requests: 2
    window_seconds: 86400
    key_prefix: ratelimit:newsletter
"#;
        let config = RatekeeperConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.grpc_addr.port(), 9000);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379/2");
        assert!(config.identity.normalize_ipv6);
        assert_eq!(config.logging.format, LogFormat::Json);

        let profiles = config.profile_set().unwrap();
        assert_eq!(profiles.len(), 6);
        assert_eq!(profiles.get("search").unwrap().max_requests, 120);
        assert_eq!(profiles.get("newsletter").unwrap().window_seconds, 86400);
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let yaml = r#"
profiles:
  broken:
    max_requests: 1
    window_seconds: 0
    key_prefix: broken
"#;
        assert!(matches!(
            RatekeeperConfig::from_yaml(yaml),
            Err(RatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = "store:\n  timeout_ms: 0\n";
        assert!(RatekeeperConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ratekeeper-{}.yaml", std::process::id()));
        std::fs::write(&path, "store:\n  timeout_ms: 75\n").unwrap();

        let config = RatekeeperConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.timeout_ms, 75);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }
}
