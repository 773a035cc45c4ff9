//! Relay Gateway Library
//!
//! Exposes one OpenAI-compatible chat completion API over several LLM vendors,
//! with prepaid quota reserved before each call and settled from actual usage

pub mod adaptor;
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

// Re-export common types
pub use config::{AppConfig, Settings};
pub use handlers::{create_router, router_from_state, AppState};
pub use models::Usage;
pub use services::RelayOrchestrator;
pub use utils::error::{RelayError, RelayResult};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get version information
pub fn version_info() -> String {
    format!("{} v{} - {}", NAME, VERSION, DESCRIPTION)
}
