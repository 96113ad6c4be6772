//! Transport codec for the text event stream.
//!
//! Records are blank-line delimited blocks of `field: value` lines:
//!
//! ```text
//! event: text-delta
//! data: {"turnId":"t1","content":"Hi"}
//!
//! ```
//!
//! [`SseDecoder`] is a push parser: bytes go in as they arrive, complete
//! records come out in arrival order. [`EventStream`] wraps a transport
//! byte stream and yields typed events.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tessera_abstraction::{ByteStream, DecodeError, StreamError};
use tracing::debug;

use crate::event::StreamEvent;

const RECORD_DELIMITER: &str = "\n\n";

/// One `(event type, payload)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRecord {
    /// Event type from the `event:` line.
    pub event: String,
    /// Payload from the `data:` line(s).
    pub data: String,
}

impl SseRecord {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self { event: event.into(), data: data.into() }
    }

    /// Writes the record in wire format, blank-line terminated.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental record decoder.
///
/// A record is emitted only once its terminating blank line has arrived.
/// Partial records and incomplete UTF-8 sequences are carried over to the
/// next [`push`](Self::push).
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// Trailing bytes of a multi-byte character cut by the chunk boundary.
    pending: Vec<u8>,
    /// Offsets in `buffer` where invalid bytes were replaced.
    invalid_at: Vec<usize>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every record it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<SseRecord, DecodeError>> {
        self.append(chunk);
        self.drain_complete()
    }

    /// Flushes whatever is buffered at end of input.
    ///
    /// A final record missing its blank line is still emitted. An incomplete
    /// UTF-8 sequence left over at this point counts as invalid.
    pub fn finish(&mut self) -> Vec<Result<SseRecord, DecodeError>> {
        if !self.pending.is_empty() {
            self.pending.clear();
            self.invalid_at.push(self.buffer.len());
            self.buffer.push(char::REPLACEMENT_CHARACTER);
        }
        let mut records = self.drain_complete();
        let rest = std::mem::take(&mut self.buffer);
        let poisoned = !self.invalid_at.is_empty();
        self.invalid_at.clear();
        if let Some(record) = parse_block(&rest, poisoned) {
            records.push(record);
        }
        records
    }

    /// Returns `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.buffer.trim().is_empty()
    }

    fn append(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.push_text(text);
                    return;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.push_text(text);
                    }
                    match err.error_len() {
                        Some(len) => {
                            self.invalid_at.push(self.buffer.len());
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    // `\r` is dropped so CRLF and LF streams split the same way.
    fn push_text(&mut self, text: &str) {
        self.buffer.extend(text.split('\r'));
    }

    fn drain_complete(&mut self) -> Vec<Result<SseRecord, DecodeError>> {
        let mut records = Vec::new();
        while let Some(end) = self.buffer.find(RECORD_DELIMITER) {
            let consumed = end + RECORD_DELIMITER.len();
            let block: String = self.buffer.drain(..consumed).collect();
            let poisoned = self.invalid_at.iter().any(|&at| at < consumed);
            self.invalid_at.retain(|&at| at >= consumed);
            for at in &mut self.invalid_at {
                *at -= consumed;
            }
            if let Some(record) = parse_block(&block[..end], poisoned) {
                records.push(record);
            }
        }
        records
    }
}

fn parse_block(block: &str, poisoned: bool) -> Option<Result<SseRecord, DecodeError>> {
    let mut event: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();
    let mut seen_field = false;

    for line in block.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        seen_field = true;
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    if !seen_field {
        return None;
    }
    if poisoned {
        let scope = event.map_or_else(|| "unnamed record".to_string(), |e| format!("event '{e}'"));
        return Some(Err(DecodeError::InvalidUtf8(scope)));
    }
    let Some(event) = event else {
        return Some(Err(DecodeError::MissingEvent));
    };
    if data.is_empty() {
        return Some(Err(DecodeError::MissingData { event: event.to_string() }));
    }
    Some(Ok(SseRecord::new(event, data.join("\n"))))
}

/// Typed events decoded from a transport byte stream, in arrival order.
///
/// Decode failures are yielded as `Err(StreamError::Decode)` items and the
/// stream keeps going. A transport failure is yielded once and ends the stream.
pub struct EventStream {
    inner: ByteStream,
    decoder: SseDecoder,
    ready: VecDeque<Result<StreamEvent, StreamError>>,
    done: bool,
}

impl EventStream {
    pub fn new(inner: ByteStream) -> Self {
        Self { inner, decoder: SseDecoder::new(), ready: VecDeque::new(), done: false }
    }

    fn enqueue(&mut self, records: Vec<Result<SseRecord, DecodeError>>) {
        for record in records {
            let event = record.and_then(|r| StreamEvent::from_record(&r)).map_err(StreamError::from);
            if let Ok(event) = &event {
                debug!(event = event.event_type(), "Decoded record");
            }
            self.ready.push_back(event);
        }
    }
}

impl Stream for EventStream {
    type Item = Result<StreamEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.ready.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let records = this.decoder.push(&bytes);
                    this.enqueue(records);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    this.ready.push_back(Err(StreamError::Transport(err)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    let records = this.decoder.finish();
                    this.enqueue(records);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
