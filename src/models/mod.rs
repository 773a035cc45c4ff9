//! Data models module
//!
//! Defines the vendor-neutral request/response shapes and each vendor's wire format

use serde::{Deserialize, Serialize};

pub mod ali;
pub mod anthropic;
pub mod openai;

/// Token accounting for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt token count
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Completion token count
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total token count
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Usage with a consistent split, taking `total_tokens` as authoritative
    ///
    /// Some backends report only a total, or a total that does not match the split;
    /// tokens missing from the split are counted as completion tokens.
    pub fn normalized(&self) -> Usage {
        let split = self.prompt_tokens.saturating_add(self.completion_tokens);
        if self.total_tokens == 0 || self.total_tokens == split {
            return Usage::new(self.prompt_tokens, self.completion_tokens);
        }
        let prompt_tokens = self.prompt_tokens.min(self.total_tokens);
        Usage {
            prompt_tokens,
            completion_tokens: self.total_tokens - prompt_tokens,
            total_tokens: self.total_tokens,
        }
    }

    /// Whether the backend reported anything at all
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_saturates() {
        let usage = Usage::new(u32::MAX, 1);
        assert_eq!(usage.total_tokens, u32::MAX);
    }

    #[test]
    fn test_normalized_trusts_total() {
        let total_only = Usage {
            total_tokens: 42,
            ..Default::default()
        };
        assert_eq!(total_only.normalized(), Usage::new(0, 42));

        let short_split = Usage {
            prompt_tokens: 30,
            completion_tokens: 2,
            total_tokens: 42,
        };
        assert_eq!(short_split.normalized(), Usage::new(30, 12));

        let long_split = Usage {
            prompt_tokens: 50,
            completion_tokens: 10,
            total_tokens: 42,
        };
        assert_eq!(long_split.normalized(), Usage::new(42, 0));

        let split_only = Usage {
            prompt_tokens: 30,
            completion_tokens: 12,
            total_tokens: 0,
        };
        assert_eq!(split_only.normalized(), Usage::new(30, 12));
    }
}
