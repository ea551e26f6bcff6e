use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_request_attempts")]
    pub request_attempts: u32,
    #[serde(default = "default_request_base_delay_ms")]
    pub request_base_delay_ms: u64,
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,
    #[serde(default = "default_read_base_delay_ms")]
    pub read_base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_throttle_ms")]
    pub update_throttle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Defaults
fn default_base_url() -> String { crate::client::OPENROUTER_BASE_URL.to_string() }
fn default_timeout_secs() -> u64 { 120 }
fn default_request_attempts() -> u32 { 3 }
fn default_request_base_delay_ms() -> u64 { 1000 }
fn default_read_attempts() -> u32 { 3 }
fn default_read_base_delay_ms() -> u64 { 250 }
fn default_multiplier() -> f64 { 2.0 }
fn default_true() -> bool { true }
fn default_throttle_ms() -> u64 { 50 }
fn default_log_level() -> String { "info".to_string() }
fn default_storage_dir() -> String {
    format!(
        "{}/.local/share/lumi",
        env::var("HOME").unwrap_or_else(|_| ".".to_string())
    )
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            request_attempts: default_request_attempts(),
            request_base_delay_ms: default_request_base_delay_ms(),
            read_attempts: default_read_attempts(),
            read_base_delay_ms: default_read_base_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            update_throttle_ms: default_throttle_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment, falling back to
    /// defaults when no config file exists
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config_path = env::var("LUMI_CONFIG").unwrap_or_else(|_| {
            let home_config = format!(
                "{}/.config/lumi/config.toml",
                env::var("HOME").unwrap_or_default()
            );
            let locations = vec!["./lumi.toml", "./config.toml", home_config.as_str()];

            for path in locations {
                if Path::new(path).exists() {
                    return path.to_string();
                }
            }

            String::new()
        });

        if config_path.is_empty() || !Path::new(&config_path).exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;

        // Substitute environment variables
        let config_content = Self::substitute_env_vars(&config_content);

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;

        Ok(config)
    }

    /// Substitute ${VAR_NAME} with environment variable values
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();

        while let Some(start) = result.find("${") {
            if let Some(end) = result[start..].find('}') {
                let var_name = &result[start + 2..start + end];
                let value = env::var(var_name).unwrap_or_default();
                result.replace_range(start..start + end + 1, &value);
            } else {
                break;
            }
        }

        result
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn update_throttle(&self) -> Duration {
        Duration::from_millis(self.session.update_throttle_ms)
    }

    pub fn request_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.request_attempts,
            base_delay: Duration::from_millis(self.retry.request_base_delay_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn read_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.read_attempts,
            base_delay: Duration::from_millis(self.retry.read_base_delay_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    /// Install a global tracing subscriber honoring `RUST_LOG` with the
    /// configured level as fallback, for embedders that don't bring their
    /// own subscriber
    pub fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.logging.level.clone()));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        unsafe { env::set_var("LUMI_TEST_VAR", "test_value") };

        let input = "base_url = \"${LUMI_TEST_VAR}\"";
        let output = Config::substitute_env_vars(input);

        assert_eq!(output, "base_url = \"test_value\"");

        unsafe { env::remove_var("LUMI_TEST_VAR") };
    }

    #[test]
    fn test_defaults_without_config_file() {
        let config = Config::default();

        assert_eq!(config.api.base_url, crate::client::OPENROUTER_BASE_URL);
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.update_throttle(), Duration::from_millis(50));
        assert_eq!(config.retry.request_attempts, 3);
    }

    #[test]
    fn test_partial_config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [api]
            base_url = "http://localhost:9000/v1"

            [session]
            update_throttle_ms = 25
            "#,
        )
        .unwrap();

        assert_eq!(config.api.base_url, "http://localhost:9000/v1");
        assert_eq!(config.session.update_throttle_ms, 25);
        assert_eq!(config.api.timeout_secs, 120);
        assert_eq!(config.retry.read_attempts, 3);
    }

    #[test]
    fn test_retry_policies_from_config() {
        let config: Config = toml::from_str(
            r#"
            [retry]
            request_attempts = 5
            request_base_delay_ms = 100
            jitter = false
            "#,
        )
        .unwrap();

        let policy = config.request_retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert!(!policy.jitter);
    }
}
