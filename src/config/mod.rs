//! Configuration management module
//!
//! Environment settings for the process, plus the JSON file describing channels, pricing and tokens.

pub mod file;
pub mod settings;

pub use file::{AppConfig, ChannelConfig, ChannelType, QuotaPolicy, ServerConfig, TokenConfig};
pub use settings::Settings;
