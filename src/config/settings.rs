//! Process settings
//!
//! Timeouts, limits, settlement tuning and logging, read from the environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Upstream HTTP configuration
    pub upstream: UpstreamConfig,
    /// Inbound request configuration
    pub request: RequestConfig,
    /// Background settlement configuration
    pub settlement: SettlementConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Explicit path of the JSON config file
    pub config_path: Option<PathBuf>,
}

/// Upstream HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Timeout for non-streaming calls, in seconds
    pub timeout: u64,
    /// Timeout for streaming calls, in seconds
    pub stream_timeout: u64,
}

/// Request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Maximum request size in bytes
    pub max_request_size: usize,
    /// Frames buffered between the relay task and the client connection
    pub stream_buffer: usize,
}

/// Settlement queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (text/json)
    pub format: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig {
                timeout: 60,
                stream_timeout: 300,
            },
            request: RequestConfig {
                max_request_size: 10 * 1024 * 1024,
                stream_buffer: 100,
            },
            settlement: SettlementConfig {
                queue_capacity: 1024,
                max_retries: 3,
                base_delay_ms: 1000,
                max_delay_ms: 10000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
            config_path: None,
        }
    }
}

impl Settings {
    /// Create a new settings instance from the environment
    pub fn new() -> Result<Self> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let level = std::env::var("LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());

        let settings = Self {
            upstream: UpstreamConfig {
                timeout: get_env_or_default("UPSTREAM_TIMEOUT", "60")
                    .parse()
                    .context("Invalid upstream timeout")?,
                stream_timeout: get_env_or_default("STREAM_TIMEOUT", "300")
                    .parse()
                    .context("Invalid stream timeout")?,
            },
            request: RequestConfig {
                max_request_size: get_env_or_default("MAX_REQUEST_SIZE", "10485760")
                    .parse()
                    .context("Invalid maximum request size")?,
                stream_buffer: get_env_or_default("STREAM_BUFFER", "100")
                    .parse()
                    .context("Invalid stream buffer size")?,
            },
            settlement: SettlementConfig {
                queue_capacity: get_env_or_default("SETTLEMENT_QUEUE_CAPACITY", "1024")
                    .parse()
                    .context("Invalid settlement queue capacity")?,
                max_retries: get_env_or_default("SETTLEMENT_MAX_RETRIES", "3")
                    .parse()
                    .context("Invalid settlement retry count")?,
                base_delay_ms: get_env_or_default("SETTLEMENT_BASE_DELAY_MS", "1000")
                    .parse()
                    .context("Invalid settlement base delay")?,
                max_delay_ms: get_env_or_default("SETTLEMENT_MAX_DELAY_MS", "10000")
                    .parse()
                    .context("Invalid settlement max delay")?,
            },
            logging: LoggingConfig {
                level,
                format: get_env_or_default("LOG_FORMAT", "text"),
            },
            config_path: std::env::var("RELAY_CONFIG").ok().map(PathBuf::from),
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.upstream.timeout == 0 || self.upstream.stream_timeout == 0 {
            anyhow::bail!("Timeout values cannot be 0");
        }

        if self.request.max_request_size == 0 {
            anyhow::bail!("Maximum request size cannot be 0");
        }

        if self.request.stream_buffer == 0 || self.settlement.queue_capacity == 0 {
            anyhow::bail!("Buffer and queue capacities cannot be 0");
        }

        if self.settlement.base_delay_ms > self.settlement.max_delay_ms {
            anyhow::bail!("Settlement base delay cannot exceed max delay");
        }

        // RUST_LOG may carry a full filter directive; only bare levels are checked
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level = self.logging.level.as_str();
        if !level.contains('=') && !valid_levels.contains(&level) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        Ok(())
    }
}

/// Get environment variable or default value
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
