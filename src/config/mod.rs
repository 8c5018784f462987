//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "dispatch.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DISPATCH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DISPATCH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DISPATCH_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Change feed connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// First resubscribe delay after a disconnect.
    pub reconnect_min_delay_ms: u64,
    /// Upper bound on resubscribe delay.
    pub reconnect_max_delay_ms: u64,
    /// How long a disconnect stays silent before the feed reports degraded.
    pub stale_notice_after_secs: u64,
    /// Buffered events per in-memory channel before slow subscribers lag.
    pub queue_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 5000,
            stale_notice_after_secs: 30,
            queue_capacity: 1024,
        }
    }
}

impl FeedConfig {
    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn stale_notice_after(&self) -> Duration {
        Duration::from_secs(self.stale_notice_after_secs)
    }
}

/// Local view reconciliation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Re-fetch every mounted view after the feed reconnects.
    pub resync_on_reconnect: bool,
    /// Periodic full re-fetch. Disabled when unset.
    pub resync_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_on_reconnect: true,
            resync_interval_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Claim/transfer coordinator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Backend calls without a response within this bound count as failed.
    pub request_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Local message log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Key namespace; keys look like `{namespace}:messages:{service_id}`.
    pub namespace: String,
    /// Directory for the file-backed log. In-memory when unset.
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "dispatch".to_string(),
            path: None,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub sync: SyncConfig,
    pub coordinator: CoordinatorConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `dispatch.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for testing: fast reconnects and short request bounds.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.feed.reconnect_min_delay_ms = 10;
        config.feed.reconnect_max_delay_ms = 100;
        config.coordinator.request_timeout_ms = 2_000;
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.reconnect_min_delay_ms > self.feed.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "feed.reconnect_min_delay_ms",
                message: "must not exceed feed.reconnect_max_delay_ms".to_string(),
            });
        }
        if self.feed.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "feed.queue_capacity",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.coordinator.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "coordinator.request_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.cache.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "cache.namespace",
                message: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.feed.reconnect_min_delay(), Duration::from_millis(100));
        assert_eq!(config.feed.stale_notice_after(), Duration::from_secs(30));
        assert!(config.sync.resync_on_reconnect);
        assert!(config.sync.resync_interval().is_none());
        assert_eq!(config.coordinator.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.namespace, "dispatch");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
feed:
  stale_notice_after_secs: 5
sync:
  resync_interval_secs: 60
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.feed.stale_notice_after_secs, 5);
        assert_eq!(config.feed.reconnect_max_delay_ms, 5000);
        assert_eq!(config.sync.resync_interval(), Some(Duration::from_secs(60)));
        assert!(config.sync.resync_on_reconnect);
    }

    #[test]
    fn test_zero_interval_disables_periodic_resync() {
        let config: Config = serde_yaml::from_str("sync:\n  resync_interval_secs: 0\n").unwrap();
        assert!(config.sync.resync_interval().is_none());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::for_test();
        config.feed.reconnect_min_delay_ms = 10_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "feed.reconnect_min_delay_ms", .. })
        ));
    }

    #[test]
    #[serial_test::serial]
    fn test_load_from_file_then_env() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "coordinator:\n  request_timeout_ms: 2500\ncache:\n  namespace: fleet").unwrap();

        std::env::set_var("DISPATCH__CACHE__NAMESPACE", "override");
        let loaded = Config::load(file.path().to_str());
        std::env::remove_var("DISPATCH__CACHE__NAMESPACE");

        let config = loaded.unwrap();
        assert_eq!(config.coordinator.request_timeout_ms, 2500);
        assert_eq!(config.cache.namespace, "override");
    }
}
