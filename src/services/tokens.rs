//! Token counting
//!
//! Prompt and completion estimates with the cl100k_base encoding.

use crate::models::openai::Message;
use crate::models::Usage;
use tiktoken_rs::CoreBPE;

const TOKENS_PER_MESSAGE: u32 = 3;
const TOKENS_PER_ROLE: u32 = 1;
/// every reply is primed with <|start|>assistant<|message|>
const REPLY_PRIMING_TOKENS: u32 = 3;

fn bpe() -> &'static CoreBPE {
    tiktoken_rs::cl100k_base_singleton()
}

/// The encoding takes a moment to build; call at startup to keep it off the request path
pub fn preload_tokenizer() {
    let _ = bpe();
}

pub fn count_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    u32::try_from(bpe().encode_with_special_tokens(text).len()).unwrap_or(u32::MAX)
}

/// Prompt tokens for a message list; only text content is counted
pub fn count_message_tokens(messages: &[Message]) -> u32 {
    let mut tokens = 0u32;
    for message in messages {
        tokens = tokens
            .saturating_add(TOKENS_PER_MESSAGE + TOKENS_PER_ROLE)
            .saturating_add(count_text_tokens(&message.text()));
        if let Some(name) = &message.name {
            tokens = tokens.saturating_add(count_text_tokens(name));
        }
    }
    tokens.saturating_add(REPLY_PRIMING_TOKENS)
}

/// Usage for a backend that reported none
pub fn estimate_usage(prompt_tokens: u32, completion_text: &str) -> Usage {
    Usage::new(prompt_tokens, count_text_tokens(completion_text))
}
