use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::classifier::{Backoff, ExceptionPolicy, PolicyRegistry, RetryPolicy};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-canonical-name API system policies (e.g. "binance")
    #[serde(default)]
    pub api_systems: HashMap<String, ApiSystemConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Polling interval when the queue is idle (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Age after which an untouched due record is abandoned (seconds)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_poll_interval() -> u64 {
    500
}

fn default_stale_after() -> u64 {
    600
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum execution attempts before a transient failure turns fatal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff (seconds)
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    /// Backoff cap (seconds)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

/// Policy for one API system, as configured
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSystemConfig {
    #[serde(default)]
    pub forbidden_codes: Vec<u16>,
    #[serde(default)]
    pub rate_limit_codes: Vec<u16>,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default)]
    pub max_calls_per_window: Option<u32>,
}

fn default_backoff_seconds() -> u64 {
    10
}

fn default_window_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("execution.poll_interval_ms", 500)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CONVEYOR_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CONVEYOR_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("CONVEYOR")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Build the per-system policy table used by the limiter and classifier.
    pub fn policy_registry(&self) -> PolicyRegistry {
        let policies = self
            .api_systems
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    ExceptionPolicy {
                        forbidden_codes: cfg.forbidden_codes.iter().copied().collect::<HashSet<_>>(),
                        rate_limit_codes: cfg
                            .rate_limit_codes
                            .iter()
                            .copied()
                            .collect::<HashSet<_>>(),
                        backoff_seconds: cfg.backoff_seconds,
                        window_seconds: cfg.window_seconds,
                        max_calls_per_window: cfg.max_calls_per_window,
                    },
                )
            })
            .collect();
        PolicyRegistry::new(policies)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(self.retry.base_backoff_secs),
                cap: Duration::from_secs(self.retry.max_backoff_secs),
            },
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.is_empty() {
            errors.push("database.url must not be empty".to_string());
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }

        if self.retry.base_backoff_secs > self.retry.max_backoff_secs {
            errors.push("retry.base_backoff_secs must not exceed max_backoff_secs".to_string());
        }

        if self.execution.poll_interval_ms == 0 {
            errors.push("execution.poll_interval_ms must be positive".to_string());
        }

        for (name, api) in &self.api_systems {
            if api.window_seconds == 0 {
                errors.push(format!("api_systems.{name}.window_seconds must be positive"));
            }
            if api.backoff_seconds == 0 {
                errors.push(format!("api_systems.{name}.backoff_seconds must be positive"));
            }
            if api.max_calls_per_window == Some(0) {
                errors.push(format!(
                    "api_systems.{name}.max_calls_per_window must be positive when set"
                ));
            }
            if api
                .forbidden_codes
                .iter()
                .any(|c| api.rate_limit_codes.contains(c))
            {
                errors.push(format!(
                    "api_systems.{name}: a code cannot be both forbidden and rate-limit"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database: DatabaseConfig {
                url: "postgres://localhost/conveyor".to_string(),
                max_connections: 5,
            },
            execution: ExecutionConfig::default(),
            retry: RetryConfig::default(),
            api_systems: HashMap::from([(
                "binance".to_string(),
                ApiSystemConfig {
                    forbidden_codes: vec![403, 418],
                    rate_limit_codes: vec![429],
                    backoff_seconds: 10,
                    window_seconds: 60,
                    max_calls_per_window: Some(1200),
                },
            )]),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn overlapping_code_sets_are_rejected() {
        let mut config = base_config();
        config
            .api_systems
            .get_mut("binance")
            .unwrap()
            .rate_limit_codes
            .push(403);
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("both forbidden")));
    }

    #[test]
    fn zero_window_quota_is_rejected() {
        let mut config = base_config();
        config
            .api_systems
            .get_mut("binance")
            .unwrap()
            .max_calls_per_window = Some(0);
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max_calls_per_window")));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = base_config();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn policy_registry_mirrors_api_systems() {
        let registry = base_config().policy_registry();
        let policy = registry.get("binance");
        assert!(policy.forbidden_codes.contains(&418));
        assert!(policy.rate_limit_codes.contains(&429));
        assert_eq!(policy.max_calls_per_window, Some(1200));

        // Unknown systems fall back to the default policy
        let fallback = registry.get("kraken");
        assert!(fallback.rate_limit_codes.contains(&429));
    }
}
