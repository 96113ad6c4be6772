//! Live-update transport and client-side reconciliation for streamed turns.
//!
//! One assistant turn arrives as an ordered text event stream. The turn may
//! fork into tool execution and a summarization pass before it ends. This
//! crate decodes the stream, routes each event to the Turn it addresses, and
//! keeps a committed tool result from ever being overwritten by late text.
//!
//! Components, leaves first:
//! - [`codec`]: bytes to `(event, payload)` records and back.
//! - [`cancel`]: one abortable handle per session with a deadline backstop.
//! - [`router`]: exhaustive dispatch of typed events to handlers.
//! - [`store`]: the single-writer table of Turns.
//! - [`lock`]: the content lock guard over a Turn's visible content.
//! - [`typewriter`]: per-turn character reveal.
//! - [`orchestrator`]: the entry point, [`FlowOrchestrator`].

pub mod cancel;
pub mod codec;
pub mod config;
pub mod event;
pub mod flags;
pub mod lock;
pub mod orchestrator;
pub mod router;
pub mod store;
pub mod transport;
pub mod turn;
pub mod typewriter;

pub use cancel::{CancelHandle, CancellationController, DEFAULT_BUDGET};
pub use codec::{EventStream, SseDecoder, SseRecord};
pub use config::{ConfigError, ConfigResult, StreamConfig};
pub use event::StreamEvent;
pub use flags::TransientFlags;
pub use lock::{CommitPermit, ContentDecision, ContentLock, ContentWrite, RejectReason};
pub use orchestrator::{FlowOrchestrator, SessionEnd, SessionOutcome, StreamSession};
pub use router::{ContentChange, Dispatch, EventRouter, IgnoreReason};
pub use store::{MessageStore, PatchOutcome, ToolSection, TurnPatch};
pub use transport::{HttpTransport, ScriptedTransport};
pub use turn::{
    LockState, LockedContainer, Phase, ToolInvocation, ToolOutcome, ToolResults, ToolStatus, Turn, TurnId,
};
pub use typewriter::{Animation, DisplayFrame, Typewriter, TypewriterConfig};

// Shared vocabulary, re-exported so callers need one dependency.
pub use tessera_abstraction::{
    AbortReason, Attachment, ByteStream, DecodeError, StreamError, StreamOptions, StreamRequest, TransportError,
    TurnTransport,
};
