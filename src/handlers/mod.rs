//! HTTP handlers module
//!
//! Contains all HTTP endpoint handling logic

pub mod admin;
pub mod health;
pub mod relay;

use crate::config::{AppConfig, Settings};
use crate::middleware::{
    auth::{admin_auth_middleware, auth_middleware},
    logging::request_logging_middleware,
};
use crate::services::meta::Caller;
use crate::services::pricing::PricingConfig;
use crate::services::quota::MemoryLedger;
use crate::services::relay::RelayOrchestrator;
use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

/// Application state
pub struct AppState {
    pub settings: Settings,
    pub config: AppConfig,
    pub relay: Arc<RelayOrchestrator>,
    pub ledger: Arc<MemoryLedger>,
    /// Caller key to caller
    callers: HashMap<String, Caller>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the state; must run inside a tokio runtime
    pub fn build(settings: Settings, config: AppConfig) -> Result<Arc<Self>> {
        let ledger = Arc::new(MemoryLedger::from_tokens(&config.tokens));
        let relay = Arc::new(RelayOrchestrator::from_config(&config, &settings, ledger.clone())?);

        let callers = config
            .tokens
            .iter()
            .map(|(key, token)| {
                (
                    key.clone(),
                    Caller {
                        token_id: token.id,
                        name: token.name.clone(),
                        group: token.group.clone(),
                    },
                )
            })
            .collect();

        Ok(Arc::new(Self {
            settings,
            config,
            relay,
            ledger,
            callers,
            started_at: Instant::now(),
        }))
    }

    pub fn resolve_caller(&self, key: &str) -> Option<Caller> {
        self.callers.get(key).cloned()
    }

    /// Re-read the config file and swap in its pricing section
    ///
    /// Channels and tokens stay as loaded at startup.
    pub fn reload_pricing(&self) -> Result<Arc<PricingConfig>> {
        let fresh = AppConfig::load_default(self.settings.config_path.as_deref())
            .context("Failed to re-read configuration for pricing reload")?;
        let pricing = self.relay.pricing();
        pricing.reload(fresh.pricing);
        Ok(pricing.snapshot())
    }
}

/// Create application router
pub async fn create_router(settings: Settings, config: AppConfig) -> Result<Router> {
    let state = AppState::build(settings, config)?;
    Ok(router_from_state(state))
}

/// Router over an existing state
pub fn router_from_state(state: Arc<AppState>) -> Router {
    // Create middleware stack
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(DefaultBodyLimit::disable());

    let api = Router::new()
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/models", get(relay::list_models))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let admin = Router::new()
        .route("/admin/pricing/reload", post(admin::reload_pricing))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .merge(api)
        .merge(admin)
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .route("/health/ready", get(health::readiness_check))
        .layer(RequestBodyLimitLayer::new(state.settings.request.max_request_size))
        .layer(middleware::from_fn(request_logging_middleware))
        .with_state(state)
        .layer(middleware_stack)
}
