//! Admin endpoints

use crate::handlers::AppState;
use crate::utils::error::RelayError;
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Pricing reload result
#[derive(Debug, Serialize, Deserialize)]
pub struct PricingReloadResponse {
    pub status: String,
    pub model_ratios: usize,
    pub completion_ratios: usize,
    pub group_ratios: usize,
}

/// Re-read pricing from the config file
///
/// POST /admin/pricing/reload
/// Calls already past the resolve step keep the rate they resolved.
pub async fn reload_pricing(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PricingReloadResponse>, RelayError> {
    let pricing = state.reload_pricing().map_err(|e| {
        error!("Pricing reload failed: {:#}", e);
        RelayError::Configuration(format!("{:#}", e))
    })?;

    info!("Pricing reloaded through the admin api");
    Ok(Json(PricingReloadResponse {
        status: "reloaded".to_string(),
        model_ratios: pricing.model_ratio.len(),
        completion_ratios: pricing.completion_ratio.len(),
        group_ratios: pricing.group_ratio.len(),
    }))
}
