//! Authentication middleware
//!
//! Resolves the caller's API key to an account and group

use crate::handlers::AppState;
use crate::utils::error::RelayError;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Authentication middleware
///
/// Looks up the bearer key and attaches the [`Caller`](crate::services::meta::Caller)
/// to the request extensions
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    debug!("Executing authentication middleware");

    // Skip authentication for health check endpoints
    if request.uri().path().starts_with("/health") {
        return Ok(next.run(request).await);
    }

    let Some(key) = extract_bearer(request.headers()) else {
        warn!("Missing authorization header");
        return Err(RelayError::Unauthorized("missing api key".to_string()));
    };

    match state.resolve_caller(key) {
        Some(caller) => {
            debug!("Authenticated account {} ({})", caller.token_id, caller.name);
            request.extensions_mut().insert(caller);
            Ok(next.run(request).await)
        }
        None => {
            warn!("Invalid API key");
            Err(RelayError::Unauthorized("invalid api key".to_string()))
        }
    }
}

/// Guards the `/admin` routes with the configured admin key
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    let Some(admin_key) = state.config.server.admin_key.as_deref() else {
        warn!("Admin request rejected, no adminKey configured");
        return Err(RelayError::Unauthorized("admin api is disabled".to_string()));
    };

    match extract_bearer(request.headers()) {
        Some(key) if key == admin_key => Ok(next.run(request).await),
        _ => {
            warn!("Invalid admin key");
            Err(RelayError::Unauthorized("invalid admin key".to_string()))
        }
    }
}

/// Key from an `Authorization: Bearer <key>` header
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
