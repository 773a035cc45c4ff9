//! Per-request routing record

use crate::config::{ChannelConfig, ChannelType};
use crate::adaptor::ApiType;
use std::collections::HashMap;

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub token_id: u64,
    pub name: String,
    pub group: String,
}

/// Routing facts for one in-flight call
///
/// Built once when the call enters the pipeline. Only the setup phase of the
/// orchestrator writes to it; adaptors and settlement read it.
#[derive(Debug, Clone)]
pub struct Meta {
    pub request_id: String,
    pub channel_type: ChannelType,
    pub api_type: Option<ApiType>,
    pub channel_id: String,
    pub base_url: String,
    pub api_key: String,
    pub model_mapping: HashMap<String, String>,
    pub token_id: u64,
    pub group: String,
    /// Model the caller asked for
    pub origin_model: String,
    /// Model sent upstream after mapping
    pub actual_model: String,
    pub is_stream: bool,
    pub prompt_tokens: u32,
}

impl Meta {
    pub fn new(
        request_id: &str,
        channel_id: &str,
        channel: &ChannelConfig,
        token_id: u64,
        group: &str,
        model: &str,
        is_stream: bool,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            channel_type: channel.channel_type,
            api_type: channel.channel_type.api_type(),
            channel_id: channel_id.to_string(),
            base_url: channel.base_url.clone(),
            api_key: channel.api_key.clone(),
            model_mapping: channel.model_mapping.clone(),
            token_id,
            group: group.to_string(),
            origin_model: model.to_string(),
            actual_model: model.to_string(),
            is_stream,
            prompt_tokens: 0,
        }
    }

    /// Apply the channel's model mapping, returns whether the name changed
    pub fn apply_model_mapping(&mut self) -> bool {
        let (actual, mapped) = map_model_name(&self.origin_model, &self.model_mapping);
        self.actual_model = actual;
        mapped
    }
}

/// Map a model name through a channel mapping
///
/// Empty targets are ignored so a half-written mapping cannot blank the model.
pub fn map_model_name(model: &str, mapping: &HashMap<String, String>) -> (String, bool) {
    match mapping.get(model) {
        Some(target) if !target.is_empty() && target != model => (target.clone(), true),
        _ => (model.to_string(), false),
    }
}
