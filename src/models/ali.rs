//! DashScope (Ali) data models

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliChatRequest {
    pub model: String,
    pub input: AliInput,
    pub parameters: AliParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliInput {
    pub messages: Vec<AliMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliParameters {
    /// Always "message" so choices carry chat messages
    pub result_format: String,
    /// Streamed chunks carry only the new fragment instead of the whole text so far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incremental_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_search: Option<bool>,
}

/// Response body and streamed chunk share one shape
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliResponse {
    #[serde(default)]
    pub output: Option<AliOutput>,
    #[serde(default)]
    pub usage: Option<AliUsage>,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Present only on errors
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliOutput {
    #[serde(default)]
    pub choices: Vec<AliChoice>,
    /// Plain-text result format, used by older models
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliChoice {
    #[serde(default)]
    pub message: AliMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AliUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl AliResponse {
    /// Error code, when the body encodes a failure
    pub fn error_code(&self) -> Option<&str> {
        self.code.as_deref().filter(|c| !c.is_empty())
    }

    /// Text carried by this body, across both result formats
    pub fn text(&self) -> String {
        match &self.output {
            Some(output) if !output.choices.is_empty() => output
                .choices
                .iter()
                .map(|c| c.message.content.as_str())
                .collect(),
            Some(output) => output.text.clone().unwrap_or_default(),
            None => String::new(),
        }
    }

    pub fn finish_reason(&self) -> Option<String> {
        let output = self.output.as_ref()?;
        output
            .choices
            .first()
            .and_then(|c| c.finish_reason.clone())
            .or_else(|| output.finish_reason.clone())
            .filter(|r| r != "null")
    }
}

/// Fragment of generated text carried by one raw streamed payload
///
/// Reads the same fields as [`AliResponse::text`], including the `output.text` format.
pub fn fragment_of(payload: &Value) -> Option<String> {
    let parsed = AliResponse::deserialize(payload).ok()?;
    parsed.output.is_some().then(|| parsed.text())
}
