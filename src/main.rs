//! Relay Gateway Server
//!
//! HTTP relay that fronts several LLM vendors behind one chat completion API
//! with prepaid quota billing, configured through a JSON channel file

use anyhow::{Context, Result};
use relaygate::config::settings::LoggingConfig;
use relaygate::config::{AppConfig, Settings};
use relaygate::handlers::{router_from_state, AppState};
use std::sync::Arc;
use relaygate::services::tokens::preload_tokenizer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Environment settings come first, they carry the log level
    let settings = Settings::new().context("Failed to load server settings")?;

    init_logging(&settings.logging)?;
    info!("{}", relaygate::version_info());

    // Load channel configuration from JSON file (required)
    let app_config = AppConfig::load_default(settings.config_path.as_deref())
        .context("Failed to load channel configuration")?;
    info!(
        "📁 Channel configuration loaded: {} channels, {} tokens",
        app_config.channels.len(),
        app_config.tokens.len()
    );

    preload_tokenizer();

    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);

    // Create router
    let state = AppState::build(settings, app_config)?;
    let app = router_from_state(state.clone());

    #[cfg(unix)]
    tokio::spawn(reload_pricing_on_sighup(state));

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("🚀 Relay gateway started!");
    info!("📝 Health check: http://{}/health", addr);
    info!("🔄 Relay endpoint: http://{}/v1/chat/completions", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start server: {}", e))?;

    Ok(())
}

/// Re-read pricing whenever the process receives SIGHUP
#[cfg(unix)]
async fn reload_pricing_on_sighup(state: Arc<AppState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Cannot listen for SIGHUP, pricing reload only via /admin: {}", e);
            return;
        }
    };

    while hangups.recv().await.is_some() {
        match state.reload_pricing() {
            Ok(pricing) => info!(
                "SIGHUP: pricing reloaded, {} model ratios",
                pricing.model_ratio.len()
            ),
            Err(e) => error!("SIGHUP: pricing reload failed: {:#}", e),
        }
    }
}

/// Initialize logging system
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .with_context(|| format!("Invalid log level '{}'", logging.level))?;

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if logging.format == "json" {
        // JSON format logs (production environment)
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        )
    } else {
        // Human readable format (development environment)
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .finish(),
        )
    };

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Logging system initialized");
    Ok(())
}
