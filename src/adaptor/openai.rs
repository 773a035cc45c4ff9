//! OpenAI-compatible adaptor
//!
//! The generic request already is the OpenAI wire format, so this adaptor mostly
//! passes bytes through. Baichuan and DeepSeek channels also use it.

use super::{
    accumulated_usage, credential, embedded_error_status, final_usage, join_url, Adaptor,
    ClientSink, ResponseFailure, UpstreamResponse,
};
use crate::config::ChannelType;
use crate::models::openai::{fragment_of, ChatCompletionResponse, GeneralRequest};
use crate::models::Usage;
use crate::services::meta::Meta;
use crate::utils::error::{RelayError, RelayResult};
use crate::utils::sse::{data_payload, SseLineDecoder, DONE_MARKER};
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

pub const MODELS: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-4",
    "gpt-4-turbo",
    "gpt-4o",
    "gpt-4o-mini",
];

/// OpenAI adaptor
pub struct OpenAIAdaptor {
    client: Client,
    channel_type: ChannelType,
    is_stream: bool,
}

impl OpenAIAdaptor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            channel_type: ChannelType::OpenAI,
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

        let parsed: ChatCompletionResponse = serde_json::from_slice(&body).map_err(|e| {
            RelayError::UpstreamProtocol {
                status: StatusCode::BAD_GATEWAY,
                code: "bad_response_body".to_string(),
                message: format!("Failed to parse upstream response: {}", e),
            }
        })?;

        if let Some(error) = parsed.error.as_ref().filter(|e| e.is_set()) {
            return Err(RelayError::UpstreamProtocol {
                status: embedded_error_status(status),
                code: error.code_string(),
                message: error.message.clone(),
            }
            .into());
        }

        let text: String = parsed.choices.iter().map(|c| c.message.text()).collect();
        let usage = final_usage(meta, parsed.usage, &text);

        // forwarded unchanged, including fields this crate does not model
        sink.send_json(status, body)
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
        let mut reported: Option<Usage> = None;
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
                if payload.is_empty() || payload == DONE_MARKER {
                    continue;
                }

                let value: Value = match serde_json::from_str(payload) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Failed to parse streaming response chunk: {} - data: {}", e, payload);
                        continue;
                    }
                };

                if let Some(error) = value.get("error").filter(|e| e.is_object()) {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("upstream stream error")
                        .to_string();
                    let code = error
                        .get("code")
                        .and_then(Value::as_str)
                        .or_else(|| error.get("type").and_then(Value::as_str))
                        .unwrap_or("upstream_error")
                        .to_string();
                    let usage = accumulated_usage(meta, reported, &text);
                    let error = RelayError::UpstreamProtocol {
                        status: StatusCode::BAD_GATEWAY,
                        code,
                        message,
                    };
                    return Err(ResponseFailure::with_usage(error, usage));
                }

                if let Some(fragment) = fragment_of(&value) {
                    text.push_str(&fragment);
                }
                if let Some(usage) = value
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
                    .filter(|u| !u.is_empty())
                {
                    reported = Some(usage);
                }

                if let Err(error) = sink.send_raw_event(payload.to_string()).await {
                    let usage = accumulated_usage(meta, reported, &text);
                    return Err(ResponseFailure::with_usage(error, usage));
                }
            }
        }

        let usage = final_usage(meta, reported, &text);
        sink.send_done()
            .await
            .map_err(|e| ResponseFailure::with_usage(e, usage))?;

        debug!("OpenAI stream finished: {} completion tokens", usage.completion_tokens);
        Ok(usage)
    }
}

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn init(&mut self, meta: &Meta) {
        self.channel_type = meta.channel_type;
        self.is_stream = meta.is_stream;
    }

    fn build_url(&self, meta: &Meta) -> RelayResult<String> {
        join_url(meta, "/v1/chat/completions")
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
        }
        Ok(headers)
    }

    fn convert_request(&self, request: &GeneralRequest) -> RelayResult<Value> {
        let mut value = serde_json::to_value(request)?;

        // Baichuan rejects an explicit zero frequency_penalty
        if self.channel_type == ChannelType::Baichuan
            && request.frequency_penalty.map_or(false, |p| p == 0.0)
        {
            if let Some(object) = value.as_object_mut() {
                object.remove("frequency_penalty");
            }
        }

        Ok(value)
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
        "openai"
    }

    fn client(&self) -> &Client {
        &self.client
    }
}
