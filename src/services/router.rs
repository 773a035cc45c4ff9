//! Channel router
//!
//! Picks the backend channel serving a model for a caller group

use crate::config::{AppConfig, ChannelConfig};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Enabled channels ordered by priority
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    /// Highest priority first, ties broken by channel id
    channels: Vec<(String, ChannelConfig)>,
}

impl ChannelRouter {
    pub fn new(channels: &HashMap<String, ChannelConfig>) -> Self {
        let mut ordered: Vec<(String, ChannelConfig)> = channels
            .iter()
            .filter(|(id, channel)| {
                if !channel.enabled {
                    debug!("Channel '{}' is disabled", id);
                }
                channel.enabled
            })
            .map(|(id, channel)| {
                let mut channel = channel.clone();
                if channel.models.is_empty() {
                    if let Some(api_type) = channel.channel_type.api_type() {
                        channel.models = api_type.default_models();
                    } else {
                        warn!("Channel '{}' serves no models", id);
                    }
                }
                (id.clone(), channel)
            })
            .collect();

        ordered.sort_by(|(a_id, a), (b_id, b)| b.priority.cmp(&a.priority).then_with(|| a_id.cmp(b_id)));

        info!("Channel router initialized with {} enabled channels", ordered.len());
        Self { channels: ordered }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.channels)
    }

    /// Highest-priority channel serving `model` to `group`
    pub fn select(&self, model: &str, group: &str) -> Option<(&str, &ChannelConfig)> {
        let selected = self
            .channels
            .iter()
            .find(|(_, channel)| {
                channel.groups.iter().any(|g| g == group) && channel.models.iter().any(|m| m == model)
            })
            .map(|(id, channel)| (id.as_str(), channel));

        if let Some((id, _)) = selected {
            debug!("Routed model '{}' for group '{}' to channel '{}'", model, group, id);
        }
        selected
    }

    /// Every model reachable from `group`, sorted
    pub fn list_models(&self, group: &str) -> Vec<String> {
        let models: BTreeSet<&str> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.groups.iter().any(|g| g == group))
            .flat_map(|(_, channel)| channel.models.iter().map(String::as_str))
            .collect();
        models.into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
