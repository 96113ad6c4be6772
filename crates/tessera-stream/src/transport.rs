//! Transports that open a turn's event stream.
//!
//! [`HttpTransport`] talks to the conversation streaming endpoint.
//! [`ScriptedTransport`] plays back a prepared byte sequence, for offline
//! replay and tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderValue};
use tessera_abstraction::{ByteStream, StreamRequest, TransportError, TurnTransport};
use tracing::{debug, error, info};

use crate::config::StreamConfig;
use crate::event::StreamEvent;

const EVENT_STREAM: &str = "text/event-stream";

/// HTTP transport for `POST {endpoint}/conversations/{id}/stream`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpTransport {
    /// Creates a transport for `endpoint` (base URL, no trailing path).
    ///
    /// No request timeout is set here; the session budget bounds the turn.
    ///
    /// # Errors
    /// Returns `TransportError::Request` if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, api_token: Option<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Request(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, endpoint: endpoint.into(), api_token })
    }

    /// Creates a transport from the configured endpoint and token.
    ///
    /// # Errors
    /// Returns `TransportError::NotConfigured` if no endpoint is configured.
    pub fn from_config(config: &StreamConfig) -> Result<Self, TransportError> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| TransportError::NotConfigured("no endpoint configured".to_string()))?;
        Self::new(endpoint, config.api_token.clone())
    }

    /// Streaming URL for `conversation_id`.
    #[must_use]
    pub fn stream_url(&self, conversation_id: &str) -> String {
        format!("{}/conversations/{conversation_id}/stream", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl TurnTransport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let url = self.stream_url(&request.conversation_id);
        debug!(url = %url, model = %request.model_id, "Opening event stream");

        let mut builder = self
            .client
            .post(&url)
            .header(ACCEPT, HeaderValue::from_static(EVENT_STREAM))
            .json(request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            error!(error = %e, url = %url, "Failed to send streaming request");
            TransportError::Request(format!("Network error: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, error = %body, url = %url, "Streaming endpoint returned error status");
            return Err(TransportError::from_status(status.as_u16(), body));
        }

        info!(url = %url, status = %status, "Event stream opened");
        let body = response.bytes_stream().map_err(|e| TransportError::Stream(e.to_string()));
        Ok(Box::pin(body))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// In-memory transport that plays back prepared chunks.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    chunks: Vec<Bytes>,
    chunk_delay: Duration,
    fail_open: Option<TransportError>,
    fail_after: Option<(usize, TransportError)>,
    hold_open: bool,
    requests: Arc<Mutex<Vec<StreamRequest>>>,
}

impl ScriptedTransport {
    /// Plays back `chunks` as-is.
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self { chunks, ..Self::default() }
    }

    /// Splits `wire` into chunks of `chunk_size` bytes (0 for one chunk).
    ///
    /// Chunk boundaries may fall inside records or inside UTF-8 sequences.
    pub fn from_sse(wire: &str, chunk_size: usize) -> Self {
        let bytes = Bytes::copy_from_slice(wire.as_bytes());
        if chunk_size == 0 || bytes.is_empty() {
            return Self::new(vec![bytes]);
        }
        let chunks = (0..bytes.len())
            .step_by(chunk_size)
            .map(|start| bytes.slice(start..(start + chunk_size).min(bytes.len())))
            .collect();
        Self::new(chunks)
    }

    /// Encodes `events` in wire format, one record per chunk.
    ///
    /// # Errors
    /// Returns an error if a payload cannot be serialized.
    pub fn from_events(events: &[StreamEvent]) -> Result<Self, serde_json::Error> {
        let chunks = events
            .iter()
            .map(|event| event.to_record().map(|record| Bytes::from(record.encode())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(chunks))
    }

    /// Waits `delay` before each chunk.
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Fails the request itself with `error`.
    #[must_use]
    pub fn failing_open(mut self, error: TransportError) -> Self {
        self.fail_open = Some(error);
        self
    }

    /// Breaks the stream with `error` after `chunks` chunks.
    #[must_use]
    pub fn failing_after(mut self, chunks: usize, error: TransportError) -> Self {
        self.fail_after = Some((chunks, error));
        self
    }

    /// Keeps the stream open after the last chunk instead of ending it.
    #[must_use]
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TurnTransport for ScriptedTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(request.clone());
        if let Some(error) = &self.fail_open {
            return Err(error.clone());
        }

        let mut items: Vec<Result<Bytes, TransportError>> = self.chunks.iter().cloned().map(Ok).collect();
        if let Some((after, error)) = &self.fail_after {
            items.truncate(*after);
            items.push(Err(error.clone()));
        }

        let delay = self.chunk_delay;
        let body = stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        if self.hold_open {
            Ok(Box::pin(body.chain(stream::pending())))
        } else {
            Ok(Box::pin(body))
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
