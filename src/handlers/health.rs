//! Health check handlers
//!
//! Provides application health status check endpoints

use crate::handlers::AppState;
use crate::services::settlement::SettlementStats;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const SERVICE_NAME: &str = "relaygate";

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service name
    pub service: String,
    /// Version information
    pub version: String,
    /// Timestamp
    pub timestamp: String,
    /// Details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

/// Check result
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthDetails {
    /// Enabled channel count
    pub channels: usize,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Settlement queue counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<SettlementStats>,
    /// Memory usage (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<MemoryUsage>,
}

/// Memory usage information
#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Resident memory in bytes
    pub used_bytes: u64,
    /// Virtual memory in bytes
    pub total_bytes: u64,
    /// Usage percentage
    pub usage_percent: f64,
}

fn response(status: &str, details: Option<HealthDetails>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        details,
    }
}

/// Basic health check
///
/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Executing health check");

    Json(response(
        "healthy",
        Some(HealthDetails {
            channels: state.relay.router().len(),
            uptime_seconds: state.started_at.elapsed().as_secs(),
            settlement: Some(state.relay.settlement().stats()),
            memory_usage: get_memory_usage(),
        }),
    ))
}

/// Readiness check
///
/// GET /health/ready
/// Ready once at least one channel can take traffic
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, StatusCode> {
    debug!("Executing readiness check");

    let channels = state.relay.router().len();
    if channels == 0 {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(response(
        "ready",
        Some(HealthDetails {
            channels,
            uptime_seconds: state.started_at.elapsed().as_secs(),
            settlement: Some(state.relay.settlement().stats()),
            memory_usage: None,
        }),
    )))
}

/// Liveness check
///
/// GET /health/live
/// Does not look at channels or the ledger
pub async fn liveness_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(response(
        "alive",
        Some(HealthDetails {
            channels: state.relay.router().len(),
            uptime_seconds: state.started_at.elapsed().as_secs(),
            settlement: None,
            memory_usage: None,
        }),
    ))
}

/// Get memory usage information
fn get_memory_usage() -> Option<MemoryUsage> {
    #[cfg(target_os = "linux")]
    {
        // Read /proc/self/status to get memory information
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> Option<u64> {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
            };

            if let (Some(used), Some(total)) = (field("VmRSS:"), field("VmSize:")) {
                let usage_percent = if total > 0 {
                    (used as f64 / total as f64) * 100.0
                } else {
                    0.0
                };
                return Some(MemoryUsage {
                    used_bytes: used,
                    total_bytes: total,
                    usage_percent,
                });
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Settings};

    fn create_test_state() -> Arc<AppState> {
        let config = AppConfig::from_json(
            r#"{"channels": {"main": {"type": "openai", "baseUrl": "https://api.openai.com", "models": ["gpt-4o"]}}}"#,
        )
        .unwrap();
        AppState::build(Settings::default(), config).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = create_test_state();
        let response = health_check(State(state)).await.0;

        assert_eq!(response.status, "healthy");
        assert_eq!(response.service, "relaygate");
        assert_eq!(response.details.unwrap().channels, 1);
    }

    #[tokio::test]
    async fn test_readiness_check() {
        let state = create_test_state();
        let response = readiness_check(State(state)).await.unwrap().0;
        assert_eq!(response.status, "ready");
    }

    #[tokio::test]
    async fn test_health_response_round_trips() {
        let state = create_test_state();
        let response = health_check(State(state)).await.0;

        let json = serde_json::to_string(&response).unwrap();
        let parsed: HealthResponse = serde_json::from_str(&json).unwrap();
        let settlement = parsed.details.unwrap().settlement.unwrap();
        assert_eq!(settlement, SettlementStats::default());
    }

    #[tokio::test]
    async fn test_liveness_check() {
        let state = create_test_state();
        let response = liveness_check(State(state)).await.0;
        assert_eq!(response.status, "alive");
    }
}
