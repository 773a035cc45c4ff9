//! Stream reconciliation
//!
//! Tees the upstream body: every chunk the adaptor pulls is also appended to a
//! capture buffer, so the full reply text can be rebuilt after the adaptor is done
//! without a second reader competing for the body.

use crate::adaptor::{BoxStream, UpstreamResponse};
use crate::utils::error::RelayResult;
use crate::utils::sse::{data_payloads, DONE_MARKER};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tracing::{debug, warn};

type Capture = Arc<Mutex<BytesMut>>;

pin_project! {
    /// Pass-through stream that copies each chunk into the capture
    pub struct ReconcilingStream<S> {
        #[pin]
        inner: S,
        capture: Capture,
    }
}

impl<S> Stream for ReconcilingStream<S>
where
    S: Stream<Item = RelayResult<Bytes>>,
{
    type Item = RelayResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let next = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &next {
            this.capture
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(chunk);
        }
        next
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Handle to the capture of one wrapped body
#[derive(Debug)]
pub struct StreamReconciler {
    capture: Capture,
}

impl StreamReconciler {
    /// Wrap a response body; the returned response reads exactly like the original
    pub fn wrap(response: UpstreamResponse) -> (UpstreamResponse, StreamReconciler) {
        let capture: Capture = Arc::new(Mutex::new(BytesMut::new()));
        let UpstreamResponse { status, headers, body } = response;
        let wrapped = ReconcilingStream {
            inner: body,
            capture: capture.clone(),
        };
        let body: BoxStream<'static, Bytes> = wrapped.boxed();
        (
            UpstreamResponse::new(status, headers, body),
            StreamReconciler { capture },
        )
    }

    /// Bytes captured so far
    pub fn captured_len(&self) -> usize {
        self.capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop capturing and take the bytes
    ///
    /// Call only after the adaptor returned; anything the body yields afterwards is not seen.
    pub fn freeze(self) -> CapturedBody {
        let bytes = match Arc::try_unwrap(self.capture) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => {
                debug!("Body still referenced at freeze, taking the capture");
                let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *guard)
            }
        };
        CapturedBody {
            bytes: bytes.freeze(),
        }
    }
}

/// Immutable copy of everything the adaptor read
#[derive(Debug, Clone, Default)]
pub struct CapturedBody {
    bytes: Bytes,
}

impl CapturedBody {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Concatenate the fragment of every `data:` payload, in arrival order
    pub fn reconstruct_text<F>(&self, fragment: F) -> String
    where
        F: Fn(&Value) -> Option<String>,
    {
        let mut text = String::new();
        for payload in data_payloads(&self.bytes) {
            if payload == DONE_MARKER {
                continue;
            }
            match serde_json::from_str::<Value>(&payload) {
                Ok(value) => {
                    if let Some(piece) = fragment(&value) {
                        text.push_str(&piece);
                    }
                }
                Err(e) => warn!("Skipping unparseable captured payload: {}", e),
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::fragment_of;
    use axum::http::{HeaderMap, StatusCode};
    use futures::stream;

    fn response_of(chunks: Vec<&'static str>) -> UpstreamResponse {
        let items: Vec<RelayResult<Bytes>> = chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
        UpstreamResponse::new(StatusCode::OK, HeaderMap::new(), stream::iter(items).boxed())
    }

    #[tokio::test]
    async fn test_wrapped_body_is_unchanged() {
        let (wrapped, reconciler) = StreamReconciler::wrap(response_of(vec!["ab", "cd"]));
        let body = wrapped.read_body().await.unwrap();
        assert_eq!(body, Bytes::from("abcd"));
        assert_eq!(reconciler.freeze().bytes(), &Bytes::from("abcd"));
    }

    #[tokio::test]
    async fn test_capture_only_holds_consumed_chunks() {
        let (mut wrapped, reconciler) = StreamReconciler::wrap(response_of(vec!["ab", "cd"]));
        let first = wrapped.body.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from("ab"));
        assert_eq!(reconciler.captured_len(), 2);
        drop(wrapped);
        assert_eq!(reconciler.freeze().bytes(), &Bytes::from("ab"));
    }

    #[test]
    fn test_reconstruct_text_skips_done() {
        let captured = CapturedBody::new(Bytes::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
             data: [DONE]\n\n",
        ));
        assert_eq!(captured.reconstruct_text(fragment_of), "Hello");
    }
}
