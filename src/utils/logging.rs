//! Logging utilities
//!
//! Shared helpers for keeping request payloads out of the logs

use crate::models::openai::{GeneralRequest, Message, MessageContent};

/// Set to true to include full request details (tools, system prompts) in debug logs
pub const VERBOSE_REQUEST_LOGGING: bool = false;

/// Truncate a string with a note about original length
pub fn truncate_content(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... ({} bytes truncated)", &s[..cut], s.len() - cut)
}

fn filter_message(msg: &Message) -> serde_json::Value {
    let content = match &msg.content {
        Some(MessageContent::Text(t)) => {
            let max_len = if msg.role == "system" { 100 } else { 200 };
            serde_json::Value::String(truncate_content(t, max_len))
        }
        Some(MessageContent::Parts(parts)) => {
            serde_json::json!(format!("[...{} content parts]", parts.len()))
        }
        None => serde_json::Value::Null,
    };

    let mut obj = serde_json::json!({
        "role": msg.role,
        "content": content,
    });
    if let Some(tool_calls) = &msg.tool_calls {
        obj["tool_calls"] = serde_json::json!(format!("[...{} tool calls]", tool_calls.len()));
    }
    obj
}

/// Create a filtered summary of a relay request for logging
pub fn create_request_log_summary(request: &GeneralRequest) -> serde_json::Value {
    if VERBOSE_REQUEST_LOGGING {
        return serde_json::to_value(request)
            .unwrap_or(serde_json::json!({"error": "serialize failed"}));
    }

    let messages: Vec<serde_json::Value> = request.messages.iter().map(filter_message).collect();
    let tools = match &request.tools {
        Some(t) if !t.is_empty() => serde_json::json!(format!("...{} tools (details truncated)", t.len())),
        _ => serde_json::Value::Null,
    };

    serde_json::json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "stream": request.stream,
        "messages": messages,
        "tools": tools,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "第一次世界大战";
        let out = truncate_content(s, 4);
        assert!(out.starts_with("第"));
        assert!(out.contains("bytes truncated"));
        assert_eq!(truncate_content("short", 10), "short");
    }
}
