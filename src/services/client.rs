//! Shared HTTP clients and retry policy

use crate::config::Settings;
use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("relaygate/", env!("CARGO_PKG_VERSION"));

/// Upstream clients, one per timeout class
///
/// Cloning is cheap; both clients share their connection pools with every clone.
#[derive(Debug, Clone)]
pub struct HttpClients {
    client: Client,
    stream_client: Client,
}

impl HttpClients {
    /// Create clients with the given timeouts
    pub fn new(timeout: Duration, stream_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        let stream_client = Client::builder()
            .timeout(stream_timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create streaming HTTP client")?;

        Ok(Self { client, stream_client })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            Duration::from_secs(settings.upstream.timeout),
            Duration::from_secs(settings.upstream.stream_timeout),
        )
    }

    /// Client for a call, by whether the reply is streamed
    pub fn pick(&self, is_stream: bool) -> Client {
        if is_stream {
            self.stream_client.clone()
        } else {
            self.client.clone()
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts
    pub max_retries: u32,
    /// Base delay time (milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay time (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10000,
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.settlement.max_retries,
            base_delay_ms: settings.settlement.base_delay_ms,
            max_delay_ms: settings.settlement.max_delay_ms,
        }
    }

    /// Exponential backoff delay before retry `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = std::cmp::min(
            self.base_delay_ms.saturating_mul(factor),
            self.max_delay_ms,
        );
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let clients = HttpClients::from_settings(&Settings::default());
        assert!(clients.is_ok());
    }

    #[test]
    fn test_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.delay_for(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for(10), Duration::from_millis(10000));
        assert_eq!(config.delay_for(200), Duration::from_millis(10000));
    }
}
