//! Anthropic Messages adaptor

use super::{
    accumulated_usage, credential, embedded_error_status, final_usage, join_url, Adaptor,
    ClientSink, ResponseFailure, UpstreamResponse,
};
use crate::models::anthropic::{
    finish_reason, fragment_of, AnthropicMessage, ContentBlock, ImageSource, MessagesRequest,
    MessagesResponse, StreamEvent,
};
use crate::models::openai::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ContentPart, Delta,
    GeneralRequest, Message, MessageContent,
};
use crate::models::Usage;
use crate::services::meta::Meta;
use crate::utils::error::{RelayError, RelayResult};
use crate::utils::sse::{data_payload, SseLineDecoder};
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

pub const MODELS: &[&str] = &[
    "claude-3-haiku-20240307",
    "claude-3-sonnet-20240229",
    "claude-3-opus-20240229",
    "claude-3-5-sonnet-20240620",
];

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic adaptor
pub struct AnthropicAdaptor {
    client: Client,
    is_stream: bool,
}

/// `data:image/png;base64,....` into media type and payload
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type.to_string(), data.to_string()))
}

fn convert_content(content: Option<&MessageContent>) -> Vec<ContentBlock> {
    match content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
                ContentPart::ImageUrl { image_url } => {
                    let source = match parse_data_url(&image_url.url) {
                        Some((media_type, data)) => ImageSource::Base64 { media_type, data },
                        None => ImageSource::Url {
                            url: image_url.url.clone(),
                        },
                    };
                    ContentBlock::Image { source }
                }
            })
            .collect(),
    }
}

impl AnthropicAdaptor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            is_stream: false,
        }
    }

    async fn handle_body(
        &self,
        response: UpstreamResponse,
        meta: &Meta,
        sink: &mut ClientSink,
    ) -> Result<Usage, ResponseFailure> {
        let status = response.status;
        let body = response.read_body().await?;

        let parsed: MessagesResponse = serde_json::from_slice(&body).map_err(|e| {
            RelayError::UpstreamProtocol {
                status: StatusCode::BAD_GATEWAY,
                code: "bad_response_body".to_string(),
                message: format!("Failed to parse upstream response: {}", e),
            }
        })?;

        if let Some(error) = parsed.error.as_ref() {
            return Err(RelayError::UpstreamProtocol {
                status: embedded_error_status(status),
                code: error.error_type.clone(),
                message: error.message.clone(),
            }
            .into());
        }

        let text = parsed.text();
        let reported = parsed
            .usage
            .map(|u| Usage::new(u.input_tokens, u.output_tokens));
        let usage = final_usage(meta, reported, &text);

        let reply = ChatCompletionResponse {
            id: parsed.id.clone(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: parsed.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: "assistant".to_string(),
                    content: Some(MessageContent::Text(text)),
                    ..Default::default()
                },
                finish_reason: parsed.stop_reason.as_deref().map(finish_reason),
            }],
            usage: Some(usage),
            error: None,
        };

        let body = serde_json::to_vec(&reply).map_err(RelayError::from)?;
        sink.send_json(StatusCode::OK, body.into())
            .await
            .map_err(|e| ResponseFailure::with_usage(e, usage))?;

        Ok(usage)
    }

    async fn handle_stream(
        &self,
        response: UpstreamResponse,
        meta: &Meta,
        sink: &mut ClientSink,
    ) -> Result<Usage, ResponseFailure> {
        let mut body = response.body;
        let mut decoder = SseLineDecoder::new();
        let mut text = String::new();
        let mut prompt_tokens = 0u32;
        let mut completion_tokens = 0u32;
        let mut id = format!("chatcmpl-{}", meta.request_id);
        let mut model = meta.actual_model.clone();
        let created = chrono::Utc::now().timestamp();
        let mut finished = false;

        let reported = |prompt: u32, completion: u32| {
            let usage = Usage::new(prompt, completion);
            (!usage.is_empty()).then_some(usage)
        };

        while !finished {
            let lines = match body.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(error)) => {
                    let usage = accumulated_usage(meta, reported(prompt_tokens, completion_tokens), &text);
                    return Err(ResponseFailure::with_usage(error, usage));
                }
                None => {
                    finished = true;
                    decoder.finish().into_iter().collect()
                }
            };

            for line in lines {
                let Some(payload) = data_payload(&line) else {
                    continue;
                };
                if payload.is_empty() {
                    continue;
                }

                let event: StreamEvent = match serde_json::from_str(payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Failed to parse Anthropic event: {} - data: {}", e, payload);
                        continue;
                    }
                };

                let delta = match event {
                    StreamEvent::MessageStart { message } => {
                        if !message.id.is_empty() {
                            id = message.id.clone();
                        }
                        if !message.model.is_empty() {
                            model = message.model.clone();
                        }
                        if let Some(usage) = message.usage {
                            prompt_tokens = usage.input_tokens;
                            completion_tokens = usage.output_tokens;
                        }
                        Some((
                            Delta {
                                role: Some("assistant".to_string()),
                                content: Some(String::new()),
                                tool_calls: None,
                            },
                            None,
                        ))
                    }
                    StreamEvent::ContentBlockDelta { delta, .. } => delta.text.map(|fragment| {
                        text.push_str(&fragment);
                        (
                            Delta {
                                role: None,
                                content: Some(fragment),
                                tool_calls: None,
                            },
                            None,
                        )
                    }),
                    StreamEvent::MessageDelta { delta, usage } => {
                        if let Some(usage) = usage {
                            completion_tokens = usage.output_tokens;
                            if usage.input_tokens > 0 {
                                prompt_tokens = usage.input_tokens;
                            }
                        }
                        delta
                            .stop_reason
                            .as_deref()
                            .map(|reason| (Delta::default(), Some(finish_reason(reason))))
                    }
                    StreamEvent::Error { error } => {
                        let usage = accumulated_usage(meta, reported(prompt_tokens, completion_tokens), &text);
                        let error = RelayError::UpstreamProtocol {
                            status: StatusCode::BAD_GATEWAY,
                            code: error.error_type,
                            message: error.message,
                        };
                        return Err(ResponseFailure::with_usage(error, usage));
                    }
                    StreamEvent::MessageStop | StreamEvent::Other => None,
                };

                let Some((delta, finish)) = delta else {
                    continue;
                };
                let chunk = ChatCompletionChunk {
                    id: id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created,
                    model: model.clone(),
                    choices: vec![ChunkChoice {
                        index: 0,
                        delta,
                        finish_reason: finish,
                    }],
                    usage: None,
                };

                if let Err(error) = sink.send_event(&chunk).await {
                    let usage = accumulated_usage(meta, reported(prompt_tokens, completion_tokens), &text);
                    return Err(ResponseFailure::with_usage(error, usage));
                }
            }
        }

        let usage = final_usage(meta, reported(prompt_tokens, completion_tokens), &text);
        sink.send_done()
            .await
            .map_err(|e| ResponseFailure::with_usage(e, usage))?;

        debug!("Anthropic stream finished: {} completion tokens", usage.completion_tokens);
        Ok(usage)
    }
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.is_stream = meta.is_stream;
    }

    fn build_url(&self, meta: &Meta) -> RelayResult<String> {
        join_url(meta, "/v1/messages")
    }

    fn build_headers(&self, meta: &Meta) -> RelayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", credential(meta, meta.api_key.clone())?);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.is_stream {
            headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        Ok(headers)
    }

    fn convert_request(&self, request: &GeneralRequest) -> RelayResult<Value> {
        if request.n.map_or(false, |n| n > 1) {
            return Err(RelayError::UnsupportedFeature(
                "Anthropic does not support n > 1".to_string(),
            ));
        }
        if request.tools.as_ref().map_or(false, |t| !t.is_empty()) {
            return Err(RelayError::UnsupportedFeature(
                "Anthropic channels do not support tools".to_string(),
            ));
        }

        let mut system = Vec::new();
        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            match message.role.as_str() {
                "system" => system.push(message.text()),
                "user" | "assistant" => messages.push(AnthropicMessage {
                    role: message.role.clone(),
                    content: convert_content(message.content.as_ref()),
                }),
                other => {
                    return Err(RelayError::UnsupportedFeature(format!(
                        "Anthropic channels do not accept '{}' messages",
                        other
                    )))
                }
            }
        }

        let converted = MessagesRequest {
            model: request.model.clone(),
            messages,
            system: (!system.is_empty()).then(|| system.join("\n")),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop_sequences(),
            stream: self.is_stream.then_some(true),
        };

        Ok(serde_json::to_value(converted)?)
    }

    async fn do_response(
        &self,
        response: UpstreamResponse,
        meta: &Meta,
        sink: &mut ClientSink,
    ) -> Result<Usage, ResponseFailure> {
        if self.is_stream {
            self.handle_stream(response, meta, sink).await
        } else {
            self.handle_body(response, meta, sink).await
        }
    }

    fn stream_fragment(&self, payload: &Value) -> Option<String> {
        fragment_of(payload)
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn client(&self) -> &Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_url() {
        assert_eq!(
            parse_data_url("data:image/png;base64,AAAA"),
            Some(("image/png".to_string(), "AAAA".to_string()))
        );
        assert_eq!(parse_data_url("https://x/y.png"), None);
    }
}
