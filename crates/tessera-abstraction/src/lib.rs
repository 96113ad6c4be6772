//! Shared vocabulary for Tessera's streaming turn transport.
//!
//! This crate defines the error taxonomy, the request surface sent to a
//! conversation's streaming endpoint, and the transport trait the flow
//! orchestrator consumes.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a stream session was aborted before its turn finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The user asked to stop the turn.
    UserCancelled,
    /// The session budget elapsed.
    Timeout,
}

impl AbortReason {
    /// Short label suitable for rendering next to the aborted turn.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::UserCancelled => "stopped",
            Self::Timeout => "timed out",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A connection-level failure while opening or reading the event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request could not be sent (DNS, connect, TLS, ...).
    #[error("Request Error: {0}")]
    Request(String),

    /// The endpoint rejected the bearer token.
    #[error("Authentication failed ({status}): {message}")]
    Unauthorized {
        /// HTTP status code.
        status: u16,
        /// Body returned by the server.
        message: String,
    },

    /// Quota exceeded or rate limited.
    #[error("Quota exceeded ({status}): {message}")]
    QuotaExceeded {
        /// HTTP status code.
        status: u16,
        /// Body returned by the server.
        message: String,
    },

    /// The server failed with a 5xx status.
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Body returned by the server.
        message: String,
    },

    /// Any other non-success status.
    #[error("API error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Body returned by the server.
        message: String,
    },

    /// The byte stream broke after it was opened.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The transport is missing required configuration.
    #[error("Transport not configured: {0}")]
    NotConfigured(String),
}

impl TransportError {
    /// Maps a non-success HTTP status and its body to a transport error.
    #[must_use]
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized { status, message },
            402 | 429 => Self::QuotaExceeded { status, message },
            500..=599 => Self::Server { status, message },
            _ => Self::Status { status, message },
        }
    }
}

/// A single malformed record. Scoped to that record only; the stream continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The record carried data but no `event:` line.
    #[error("record has no event line")]
    MissingEvent,

    /// The record named an event but carried no `data:` line.
    #[error("record '{event}' has no data line")]
    MissingData {
        /// Event type named by the record.
        event: String,
    },

    /// The payload was not valid JSON for the named event.
    #[error("invalid payload for '{event}': {message}")]
    InvalidPayload {
        /// Event type named by the record.
        event: String,
        /// Parser message.
        message: String,
    },

    /// The record contained bytes that are not UTF-8.
    #[error("invalid UTF-8 in record: {0}")]
    InvalidUtf8(String),
}

/// Error taxonomy for one streamed turn.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// One malformed record; logged and skipped.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Connection-level failure; terminal for the turn.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// One tool invocation failed; the remaining invocations still run.
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution {
        /// Name of the failing tool, or its index when the name is unknown.
        tool: String,
        /// Failure reported by the server.
        message: String,
    },

    /// The summarization pass failed; the locked tool content stays visible.
    #[error("Summary error: {0}")]
    Summary(String),

    /// The session was stopped by the user or by its budget.
    #[error("Stream {0}")]
    Aborted(AbortReason),

    /// The server reported a turn error before any turn was created.
    #[error("Turn failed: {0}")]
    TurnFailed(String),

    /// A handler could not apply an event (protocol violation).
    #[error("Handler error: {0}")]
    Handler(String),
}

impl StreamError {
    /// Returns `true` for errors that are surfaced inline and do not end the turn.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::ToolExecution { .. } | Self::Summary(_))
    }

    /// Returns the abort reason when this error represents a cancellation.
    #[must_use]
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Aborted(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// A file sent along with the user's message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// File name as shown to the model.
    pub name: String,
    /// MIME type of the content.
    pub mime_type: String,
    /// Base64-encoded content.
    pub data: String,
}

impl Attachment {
    /// Builds an attachment from raw bytes, encoding them as base64.
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self { name: name.into(), mime_type: mime_type.into(), data: BASE64.encode(bytes) }
    }

    /// Decodes the attachment content.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// Per-turn generation options chosen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Backend model to converse with.
    pub model_id: String,
    /// Sampling temperature, between 0 and 2.
    pub temperature: f32,
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Files sent with the message.
    pub attachments: Vec<Attachment>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            model_id: "default".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            system_prompt: None,
            attachments: Vec::new(),
        }
    }
}

/// Body of the request to a conversation's streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    /// Conversation the turn belongs to.
    pub conversation_id: String,
    /// The user's message.
    pub content: String,
    /// Backend model to converse with.
    pub model_id: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Optional system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Files sent with the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl StreamRequest {
    /// Builds a request for one turn of `conversation_id`.
    #[must_use]
    pub fn new(
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        options: StreamOptions,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: content.into(),
            model_id: options.model_id,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            system_prompt: options.system_prompt,
            attachments: options.attachments,
        }
    }
}

/// Raw response body of a streaming request, in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Opens the server-to-client event stream for one turn.
///
/// Implementations must be `Send + Sync` so one transport can serve
/// sessions for several conversations.
#[async_trait]
pub trait TurnTransport: Send + Sync {
    /// Issues the request and returns the response body as a byte stream.
    ///
    /// # Errors
    /// Returns a `TransportError` if the request fails or the server
    /// answers with a non-success status.
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}
