//! Relay endpoints
//!
//! The relay runs on its own task and writes to a [`ClientSink`]; the first frame
//! it produces decides whether the client gets a JSON body or an event stream.

use crate::adaptor::{ClientSink, SinkFrame};
use crate::handlers::AppState;
use crate::middleware::logging::RequestId;
use crate::services::meta::Caller;
use crate::utils::error::RelayError;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive},
    response::{IntoResponse, Response, Sse},
    Extension, Json,
};
use futures::{stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, Instrument, Span};
use uuid::Uuid;

/// Relay a chat completion
///
/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Response {
    let request_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (mut sink, mut rx) = ClientSink::channel(state.settings.request.stream_buffer);
    let relay = state.relay.clone();
    let task = tokio::spawn(
        async move { relay.relay_text(&caller, &request_id, body, &mut sink).await }
            .instrument(Span::current()),
    );

    match rx.recv().await {
        Some(SinkFrame::Json { status, body }) => {
            (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        Some(SinkFrame::Event(first)) => event_stream(first, rx),
        // nothing was written, so the relay failed before replying
        None => match task.await {
            Ok(Ok(outcome)) => {
                error!("Relay for reservation {} produced no reply", outcome.reservation_id);
                RelayError::Internal("relay finished without a reply".to_string()).into_response()
            }
            Ok(Err(e)) => e.into_response(),
            Err(e) => RelayError::Internal(format!("relay task failed: {}", e)).into_response(),
        },
    }
}

fn event_stream(first: String, rx: mpsc::Receiver<SinkFrame>) -> Response {
    let frames = stream::once(async move { SinkFrame::Event(first) }).chain(ReceiverStream::new(rx));
    let events = frames.map(|frame| {
        let data = match frame {
            SinkFrame::Event(data) => data,
            SinkFrame::Json { body, .. } => String::from_utf8_lossy(&body).into_owned(),
        };
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    debug!("Streaming reply to client");
    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

/// Models reachable for the caller's group
///
/// GET /v1/models
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> (StatusCode, Json<ModelList>) {
    let data = state
        .relay
        .router()
        .list_models(&caller.group)
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            owned_by: "relaygate",
        })
        .collect();

    (
        StatusCode::OK,
        Json(ModelList {
            object: "list",
            data,
        }),
    )
}
