//! Vendor adaptors
//!
//! Each backend vendor implements [`Adaptor`]. The orchestrator only ever talks to
//! this trait, so adding a vendor means adding a module here and a registry arm.

pub mod ali;
pub mod anthropic;
pub mod openai;
pub mod sink;

use crate::models::openai::GeneralRequest;
use crate::models::Usage;
use crate::services::client::HttpClients;
use crate::services::meta::Meta;
use crate::services::tokens::estimate_usage;
use crate::utils::error::{ErrorContext, RelayError, RelayResult};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;

pub use ali::AliAdaptor;
pub use anthropic::AnthropicAdaptor;
pub use openai::OpenAIAdaptor;
pub use sink::{ClientSink, SinkFrame};

/// A boxed stream of body chunks
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = RelayResult<T>> + Send + 'a>>;

/// Wire protocol family of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    #[serde(rename = "openai")]
    OpenAI,
    Ali,
    Anthropic,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::OpenAI => "openai",
            ApiType::Ali => "ali",
            ApiType::Anthropic => "anthropic",
        }
    }

    /// Models a channel of this type serves when its config lists none
    pub fn default_models(&self) -> Vec<String> {
        let models: &[&str] = match self {
            ApiType::OpenAI => openai::MODELS,
            ApiType::Ali => ali::MODELS,
            ApiType::Anthropic => anthropic::MODELS,
        };
        models.iter().map(|m| m.to_string()).collect()
    }
}

/// Backend reply as seen by an adaptor
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Bytes>,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BoxStream<'static, Bytes>) -> Self {
        Self { status, headers, body }
    }

    /// Response whose body is already in memory
    pub fn from_bytes(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(axum::http::header::CONTENT_TYPE, value);
        }
        let chunk: RelayResult<Bytes> = Ok(body.into());
        Self::new(status, headers, stream::iter(vec![chunk]).boxed())
    }

    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.unreachable_context("Failed to read upstream body"))
            .boxed();
        Self::new(status, headers, body)
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn is_json(&self) -> bool {
        self.content_type().starts_with("application/json")
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type().starts_with("text/event-stream")
    }

    /// Drain the whole body
    pub async fn read_body(self) -> RelayResult<Bytes> {
        let mut body = self.body;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Failure of `do_response`, with whatever usage was accumulated before it
#[derive(Debug)]
pub struct ResponseFailure {
    pub error: RelayError,
    pub partial_usage: Option<Usage>,
}

impl ResponseFailure {
    pub fn with_usage(error: RelayError, usage: Usage) -> Self {
        Self {
            error,
            partial_usage: (!usage.is_empty()).then_some(usage),
        }
    }
}

impl From<RelayError> for ResponseFailure {
    fn from(error: RelayError) -> Self {
        Self {
            error,
            partial_usage: None,
        }
    }
}

/// Protocol adaptation for one backend vendor
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Bind per-call facts from the request context; no I/O
    fn init(&mut self, meta: &Meta);

    fn build_url(&self, meta: &Meta) -> RelayResult<String>;

    fn build_headers(&self, meta: &Meta) -> RelayResult<HeaderMap>;

    /// Generic request to the vendor's request body
    fn convert_request(&self, request: &GeneralRequest) -> RelayResult<Value>;

    /// Send the prepared request
    async fn do_request(&self, url: &str, headers: HeaderMap, body: Bytes) -> RelayResult<UpstreamResponse> {
        let response = self
            .client()
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .unreachable_context("Failed to send request")?;
        Ok(UpstreamResponse::from_reqwest(response))
    }

    /// Translate the vendor reply for the client and compute usage
    async fn do_response(
        &self,
        response: UpstreamResponse,
        meta: &Meta,
        sink: &mut ClientSink,
    ) -> Result<Usage, ResponseFailure>;

    /// Reply text carried by one streamed `data:` payload
    fn stream_fragment(&self, payload: &Value) -> Option<String>;

    fn models(&self) -> Vec<String>;

    fn name(&self) -> &'static str;

    fn client(&self) -> &Client;
}

/// Constructs a fresh adaptor per call
#[derive(Debug, Clone)]
pub struct AdaptorRegistry {
    clients: HttpClients,
}

impl AdaptorRegistry {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }

    /// Adaptor for the call's api type, already bound to it
    pub fn get(&self, meta: &Meta) -> Option<Box<dyn Adaptor>> {
        let client = self.clients.pick(meta.is_stream);
        let mut adaptor: Box<dyn Adaptor> = match meta.api_type? {
            ApiType::OpenAI => Box::new(OpenAIAdaptor::new(client)),
            ApiType::Ali => Box::new(AliAdaptor::new(client)),
            ApiType::Anthropic => Box::new(AnthropicAdaptor::new(client)),
        };
        adaptor.init(meta);
        Some(adaptor)
    }
}

/// Join a base URL and a path without doubling slashes
pub(crate) fn join_url(meta: &Meta, path: &str) -> RelayResult<String> {
    let base = meta.base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(RelayError::Configuration(format!(
            "channel '{}' has no base URL",
            meta.channel_id
        )));
    }
    Ok(format!("{}{}", base, path))
}

/// Header value for a channel credential
pub(crate) fn credential(meta: &Meta, value: String) -> RelayResult<HeaderValue> {
    if meta.api_key.is_empty() {
        return Err(RelayError::Configuration(format!(
            "channel '{}' has no API key",
            meta.channel_id
        )));
    }
    let mut header = HeaderValue::from_str(&value).map_err(|_| {
        RelayError::Configuration(format!(
            "channel '{}' API key is not a valid header value",
            meta.channel_id
        ))
    })?;
    header.set_sensitive(true);
    Ok(header)
}

/// Usage to bill for a reply cut short: reported usage, else an estimate from the text seen
pub(crate) fn accumulated_usage(meta: &Meta, reported: Option<Usage>, text: &str) -> Usage {
    match reported {
        Some(usage) => usage.normalized(),
        None if !text.is_empty() => estimate_usage(meta.prompt_tokens, text),
        None => Usage::default(),
    }
}

/// Usage of a completed reply, estimated when the vendor reported none
pub(crate) fn final_usage(meta: &Meta, reported: Option<Usage>, text: &str) -> Usage {
    reported
        .filter(|usage| !usage.is_empty())
        .map(|usage| usage.normalized())
        .unwrap_or_else(|| estimate_usage(meta.prompt_tokens, text))
}

/// Error status to report for a vendor error carried in a reply with `status`
pub(crate) fn embedded_error_status(status: StatusCode) -> StatusCode {
    if status.is_success() {
        StatusCode::BAD_GATEWAY
    } else {
        status
    }
}
