//! File-based configuration loading
//!
//! Loads channel, pricing and token configuration from a JSON file

use crate::adaptor::ApiType;
use crate::services::pricing::PricingConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host (default: "127.0.0.1" - localhost only)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer key for the `/admin` routes; they are disabled when unset
    #[serde(rename = "adminKey", default, skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_key: None,
        }
    }
}

/// Application configuration loaded from JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (optional, defaults to localhost:3000)
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend channels keyed by channel id
    pub channels: HashMap<String, ChannelConfig>,

    /// Model and group price ratios
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Caller keys and their prepaid accounts
    #[serde(default)]
    pub tokens: HashMap<String, TokenConfig>,

    /// Reservation policy
    #[serde(default)]
    pub quota: QuotaPolicy,
}

/// Backend vendor of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    #[serde(rename = "openai")]
    OpenAI,
    /// OpenAI-compatible, but rejects a zero frequency_penalty
    Baichuan,
    /// OpenAI-compatible
    DeepSeek,
    Ali,
    Anthropic,
    /// Anything this build has no adaptor for
    #[serde(other)]
    Unknown,
}

impl ChannelType {
    /// Wire protocol spoken by this channel type
    pub fn api_type(&self) -> Option<ApiType> {
        match self {
            ChannelType::OpenAI | ChannelType::Baichuan | ChannelType::DeepSeek => Some(ApiType::OpenAI),
            ChannelType::Ali => Some(ApiType::Ali),
            ChannelType::Anthropic => Some(ApiType::Anthropic),
            ChannelType::Unknown => None,
        }
    }

    /// Whether the request must be re-serialised even when it is wire compatible
    pub fn requires_reserialize(&self) -> bool {
        matches!(self, ChannelType::Baichuan)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::Baichuan => "baichuan",
            ChannelType::DeepSeek => "deepseek",
            ChannelType::Ali => "ali",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Unknown => "unknown",
        }
    }
}

/// Channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel type (e.g., "openai", "ali")
    #[serde(rename = "type")]
    pub channel_type: ChannelType,

    /// Base URL for the channel API
    #[serde(rename = "baseUrl")]
    pub base_url: String,

    /// API key
    #[serde(rename = "apiKey", default)]
    pub api_key: String,

    /// Models served by this channel
    #[serde(default)]
    pub models: Vec<String>,

    /// Requested model name to upstream model name
    #[serde(rename = "modelMapping", default)]
    pub model_mapping: HashMap<String, String>,

    /// Caller groups allowed to use this channel
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    /// Higher priority channels are selected first
    #[serde(default)]
    pub priority: i64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Caller token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Account id the token bills to
    pub id: u64,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_group")]
    pub group: String,

    /// Initial prepaid balance
    #[serde(default)]
    pub quota: i64,
}

/// Quota reservation policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Flat token allowance added to every estimate
    #[serde(rename = "preConsumedQuota", default = "default_pre_consumed")]
    pub pre_consumed_quota: i64,

    /// Accounts holding more than this many estimates are not pre-charged
    #[serde(rename = "trustMultiplier", default = "default_trust_multiplier")]
    pub trust_multiplier: i64,
}

fn default_groups() -> Vec<String> {
    vec![default_group()]
}

fn default_group() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_pre_consumed() -> i64 {
    500
}

fn default_trust_multiplier() -> i64 {
    100
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            pre_consumed_quota: default_pre_consumed(),
            trust_multiplier: default_trust_multiplier(),
        }
    }
}

impl AppConfig {
    /// Load configuration from JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(content).with_context(|| "Failed to parse config JSON")?;

        config.validate()?;

        debug!("Loaded {} channels and {} tokens", config.channels.len(), config.tokens.len());
        Ok(config)
    }

    /// Load configuration from the explicit path or default locations
    /// Searches in order:
    /// 1. the explicit path, when given
    /// 2. ~/.config/relaygate/relaygate.json
    /// 3. ./relaygate.json
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Some(home) = dirs::home_dir() {
            let config_path = home.join(".config").join("relaygate").join("relaygate.json");
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        let local_path = Path::new("relaygate.json");
        if local_path.exists() {
            return Self::load(local_path);
        }

        anyhow::bail!(
            "Configuration file not found. Please create one at:\n\
             - ~/.config/relaygate/relaygate.json (recommended)\n\
             - ./relaygate.json (current directory)\n\
             or point RELAY_CONFIG at it."
        )
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            anyhow::bail!("At least one channel must be configured");
        }

        for (name, channel) in &self.channels {
            if channel.channel_type == ChannelType::Unknown {
                // kept so requests against it fail at dispatch with a clear error
                warn!("Channel '{}' has a type this build cannot relay to", name);
            }

            if !channel.base_url.starts_with("http") {
                anyhow::bail!("Invalid base URL for channel '{}': {}", name, channel.base_url);
            }

            // known types fall back to their adaptor's model list
            if channel.models.is_empty() && channel.channel_type.api_type().is_none() {
                anyhow::bail!("Channel '{}' must list the models it serves", name);
            }

            if channel.groups.is_empty() {
                anyhow::bail!("Channel '{}' must allow at least one group", name);
            }
        }

        let mut ids = HashSet::new();
        for (key, token) in &self.tokens {
            if key.len() < 8 || key.contains(char::is_whitespace) {
                anyhow::bail!("Token '{}' must be at least 8 characters without whitespace", token.name);
            }
            if !ids.insert(token.id) {
                anyhow::bail!("Token id {} is configured more than once", token.id);
            }
            if token.quota < 0 {
                anyhow::bail!("Token id {} has a negative quota", token.id);
            }
        }

        if let Some(admin_key) = &self.server.admin_key {
            if admin_key.len() < 8 || admin_key.contains(char::is_whitespace) {
                anyhow::bail!("adminKey must be at least 8 characters without whitespace");
            }
            if self.tokens.contains_key(admin_key) {
                anyhow::bail!("adminKey must differ from every caller token");
            }
        }

        if self.quota.pre_consumed_quota < 0 || self.quota.trust_multiplier < 1 {
            anyhow::bail!("preConsumedQuota must be >= 0 and trustMultiplier >= 1");
        }

        Ok(())
    }

    /// Resolve a caller key to its token
    pub fn resolve_token(&self, key: &str) -> Option<&TokenConfig> {
        self.tokens.get(key)
    }
}
