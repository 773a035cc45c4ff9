//! Upstream failure translation
//!
//! Turns a backend error reply into a `RelayError::UpstreamProtocol` carrying the
//! backend's status and, when it can be read, the backend's own code and message.

use crate::adaptor::{embedded_error_status, UpstreamResponse};
use crate::services::meta::Meta;
use crate::utils::error::RelayError;
use axum::http::StatusCode;
use serde_json::Value;
use tracing::warn;

/// Longest raw body excerpt carried into an error message
pub const BODY_EXCERPT_LIMIT: usize = 512;

const FALLBACK_CODE: &str = "bad_response_status_code";

/// Whether the reply must go through the error handler instead of the adaptor
pub fn is_error_happened(meta: &Meta, response: &UpstreamResponse) -> bool {
    if response.status != StatusCode::OK {
        return true;
    }
    // a JSON body where a stream was expected is an error envelope
    meta.is_stream && response.is_json()
}

/// Read a failed reply and translate it
pub async fn relay_error_handler(response: UpstreamResponse) -> RelayError {
    let status = response.status;
    match response.read_body().await {
        Ok(body) => parse_upstream_error(status, &body),
        Err(e) => {
            warn!("Failed to read upstream error body: {}", e);
            RelayError::UpstreamProtocol {
                status: embedded_error_status(status),
                code: "read_response_body_failed".to_string(),
                message: format!("bad response status code {}", status.as_u16()),
            }
        }
    }
}

/// Translate an error body in any of the recognised vendor shapes
pub fn parse_upstream_error(status: StatusCode, body: &[u8]) -> RelayError {
    let status = embedded_error_status(status);

    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some((code, message)) = recognise(&value) {
            return RelayError::UpstreamProtocol {
                status,
                code: code.unwrap_or_else(|| FALLBACK_CODE.to_string()),
                message: if message.is_empty() {
                    format!("bad response status code {}", status.as_u16())
                } else {
                    message
                },
            };
        }
    }

    RelayError::UpstreamProtocol {
        status,
        code: FALLBACK_CODE.to_string(),
        message: format!(
            "bad response status code {}: {}",
            status.as_u16(),
            excerpt(&String::from_utf8_lossy(body), BODY_EXCERPT_LIMIT)
        ),
    }
}

/// (code, message) from an OpenAI, Anthropic or DashScope error body
fn recognise(value: &Value) -> Option<(Option<String>, String)> {
    let string_of = |v: Option<&Value>| -> Option<String> {
        match v? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    match value.get("error") {
        // OpenAI {"error":{...}} and Anthropic {"type":"error","error":{...}}
        Some(Value::Object(error)) => {
            let code = string_of(error.get("code")).or_else(|| string_of(error.get("type")));
            let message = string_of(error.get("message")).unwrap_or_default();
            Some((code, message))
        }
        Some(Value::String(message)) if !message.is_empty() => Some((None, message.clone())),
        _ => {
            // DashScope {"code":..,"message":..}
            let code = string_of(value.get("code"))?;
            let message = string_of(value.get("message")).unwrap_or_default();
            Some((Some(code), message))
        }
    }
}

fn excerpt(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
