//! DashScope (Ali) adaptor

use super::{
    accumulated_usage, credential, embedded_error_status, final_usage, join_url, Adaptor,
    ClientSink, ResponseFailure, UpstreamResponse,
};
use crate::models::ali::{fragment_of, AliChatRequest, AliInput, AliMessage, AliParameters, AliResponse};
use crate::models::openai::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, Delta, GeneralRequest,
    Message, MessageContent,
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

pub const MODELS: &[&str] = &["qwen-turbo", "qwen-plus", "qwen-max", "qwen-max-longcontext"];

/// DashScope adaptor
pub struct AliAdaptor {
    client: Client,
    is_stream: bool,
}

impl AliAdaptor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            is_stream: false,
        }
    }

    fn response_id(response: &AliResponse, meta: &Meta) -> String {
        format!(
            "chatcmpl-{}",
            response.request_id.as_deref().unwrap_or(&meta.request_id)
        )
    }

    fn protocol_error(status: StatusCode, response: &AliResponse) -> Option<RelayError> {
        let code = response.error_code()?;
        Some(RelayError::UpstreamProtocol {
            status: embedded_error_status(status),
            code: code.to_string(),
            message: response.message.clone().unwrap_or_default(),
        })
    }

    fn reported_usage(response: &AliResponse) -> Option<Usage> {
        response
            .usage
            .map(|u| Usage::new(u.input_tokens, u.output_tokens))
            .filter(|u| !u.is_empty())
    }

    async fn handle_body(
        &self,
        response: UpstreamResponse,
        meta: &Meta,
        sink: &mut ClientSink,
    ) -> Result<Usage, ResponseFailure> {
        let status = response.status;
        let body = response.read_body().await?;

        let parsed: AliResponse = serde_json::from_slice(&body).map_err(|e| {
            RelayError::UpstreamProtocol {
                status: StatusCode::BAD_GATEWAY,
                code: "bad_response_body".to_string(),
                message: format!("Failed to parse upstream response: {}", e),
            }
        })?;

        if let Some(error) = Self::protocol_error(status, &parsed) {
            return Err(error.into());
        }

        let text = parsed.text();
        let usage = final_usage(meta, Self::reported_usage(&parsed), &text);

        let reply = ChatCompletionResponse {
            id: Self::response_id(&parsed, meta),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: meta.actual_model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: "assistant".to_string(),
                    content: Some(MessageContent::Text(text)),
                    ..Default::default()
                },
                finish_reason: parsed.finish_reason(),
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
        let status = response.status;
        let mut body = response.body;
        let mut decoder = SseLineDecoder::new();
        let mut text = String::new();
        let mut reported: Option<Usage> = None;
        let created = chrono::Utc::now().timestamp();
        let mut finished = false;

        while !finished {
            let lines = match body.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(error)) => {
                    let usage = accumulated_usage(meta, reported, &text);
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

                let parsed: AliResponse = match serde_json::from_str(payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("Failed to parse DashScope chunk: {} - data: {}", e, payload);
                        continue;
                    }
                };

                if let Some(error) = Self::protocol_error(status, &parsed) {
                    let usage = accumulated_usage(meta, reported, &text);
                    return Err(ResponseFailure::with_usage(error, usage));
                }

                // usage is cumulative, the last report wins
                if let Some(usage) = Self::reported_usage(&parsed) {
                    reported = Some(usage);
                }

                let fragment = parsed.text();
                text.push_str(&fragment);

                let chunk = ChatCompletionChunk {
                    id: Self::response_id(&parsed, meta),
                    object: "chat.completion.chunk".to_string(),
                    created,
                    model: meta.actual_model.clone(),
                    choices: vec![ChunkChoice {
                        index: 0,
                        delta: Delta {
                            role: None,
                            content: Some(fragment),
                            tool_calls: None,
                        },
                        finish_reason: parsed.finish_reason(),
                    }],
                    usage: None,
                };

                if let Err(error) = sink.send_event(&chunk).await {
                    let usage = accumulated_usage(meta, reported, &text);
                    return Err(ResponseFailure::with_usage(error, usage));
                }
            }
        }

        let usage = final_usage(meta, reported, &text);
        sink.send_done()
            .await
            .map_err(|e| ResponseFailure::with_usage(e, usage))?;

        debug!("DashScope stream finished: {} completion tokens", usage.completion_tokens);
        Ok(usage)
    }
}

#[async_trait]
impl Adaptor for AliAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.is_stream = meta.is_stream;
    }

    fn build_url(&self, meta: &Meta) -> RelayResult<String> {
        join_url(meta, "/api/v1/services/aigc/text-generation/generation")
    }

    fn build_headers(&self, meta: &Meta) -> RelayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            credential(meta, format!("Bearer {}", meta.api_key))?,
        );
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.is_stream {
            headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
            headers.insert("x-dashscope-sse", HeaderValue::from_static("enable"));
        }
        Ok(headers)
    }

    fn convert_request(&self, request: &GeneralRequest) -> RelayResult<Value> {
        if request.n.map_or(false, |n| n > 1) {
            return Err(RelayError::UnsupportedFeature(
                "DashScope does not support n > 1".to_string(),
            ));
        }
        if request.tools.as_ref().map_or(false, |t| !t.is_empty()) {
            return Err(RelayError::UnsupportedFeature(
                "DashScope channels do not support tools".to_string(),
            ));
        }

        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            if message.content.as_ref().map_or(false, |c| c.has_images()) {
                return Err(RelayError::UnsupportedFeature(
                    "DashScope text generation does not accept images".to_string(),
                ));
            }
            messages.push(AliMessage {
                role: message.role.clone(),
                content: message.text(),
            });
        }

        let converted = AliChatRequest {
            model: request.model.clone(),
            input: AliInput { messages },
            parameters: AliParameters {
                result_format: "message".to_string(),
                incremental_output: self.is_stream.then_some(true),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
                seed: request.seed,
                stop: request.stop_sequences(),
                enable_search: request.extra.get("enable_search").and_then(Value::as_bool),
            },
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
        "ali"
    }

    fn client(&self) -> &Client {
        &self.client
    }
}
