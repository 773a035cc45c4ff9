//! Client-facing writer used by adaptors
//!
//! The HTTP handler owns the receiving end and turns frames into either a single
//! JSON response or an SSE stream, depending on the first frame it sees.

use crate::utils::error::{ErrorWithStatusCode, RelayError, RelayResult};
use crate::utils::sse::DONE_MARKER;
use axum::http::StatusCode;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

/// One unit of output for the client
#[derive(Debug, Clone, PartialEq)]
pub enum SinkFrame {
    /// Complete non-streaming reply
    Json { status: StatusCode, body: Bytes },
    /// Payload of one `data:` event
    Event(String),
}

/// Writes translated output to the client connection
#[derive(Debug)]
pub struct ClientSink {
    tx: mpsc::Sender<SinkFrame>,
    committed: bool,
}

impl ClientSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SinkFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, committed: false }, rx)
    }

    /// Whether anything has been handed to the client yet
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    async fn send(&mut self, frame: SinkFrame) -> RelayResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::ClientDisconnected)?;
        self.committed = true;
        Ok(())
    }

    pub async fn send_json(&mut self, status: StatusCode, body: Bytes) -> RelayResult<()> {
        self.send(SinkFrame::Json { status, body }).await
    }

    /// Serialise a value as one SSE event
    pub async fn send_event<T: Serialize>(&mut self, value: &T) -> RelayResult<()> {
        let data = serde_json::to_string(value)?;
        self.send(SinkFrame::Event(data)).await
    }

    /// Forward an already-encoded payload unchanged
    pub async fn send_raw_event(&mut self, data: String) -> RelayResult<()> {
        self.send(SinkFrame::Event(data)).await
    }

    pub async fn send_done(&mut self) -> RelayResult<()> {
        self.send(SinkFrame::Event(DONE_MARKER.to_string())).await
    }

    /// Terminate a started stream with an error event
    pub async fn send_error(&mut self, error: &ErrorWithStatusCode) -> RelayResult<()> {
        self.send_event(&error.to_response_body()).await?;
        self.send_done().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_are_delivered_in_order() {
        let (mut sink, mut rx) = ClientSink::channel(4);
        assert!(!sink.is_committed());

        sink.send_raw_event("{\"a\":1}".to_string()).await.unwrap();
        sink.send_done().await.unwrap();
        assert!(sink.is_committed());

        assert_eq!(rx.recv().await, Some(SinkFrame::Event("{\"a\":1}".to_string())));
        assert_eq!(rx.recv().await, Some(SinkFrame::Event("[DONE]".to_string())));
    }

    #[tokio::test]
    async fn test_closed_receiver_reports_disconnect() {
        let (mut sink, rx) = ClientSink::channel(1);
        drop(rx);
        let result = sink.send_done().await;
        assert!(matches!(result, Err(RelayError::ClientDisconnected)));
        assert!(!sink.is_committed());
    }
}
