//! Flow orchestrator: the public entry point for streaming one turn.
//!
//! A [`StreamSession`] owns everything one turn needs: the cancellation
//! controller, the transport request, the router (and with it the store)
//! and the typewriter. [`StreamSession::run`] drives the stream to an end
//! and always leaves through the same exit path, which disarms the deadline,
//! hands the display its final text and clears the transient flags exactly
//! once. A reveal still running for a completed turn is left to finish on its
//! own; frame subscribers see the channel close when it does.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tessera_abstraction::{AbortReason, StreamError, StreamOptions, StreamRequest, TurnTransport};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelHandle, CancellationController};
use crate::codec::EventStream;
use crate::config::StreamConfig;
use crate::event::StreamEvent;
use crate::flags::TransientFlags;
use crate::router::{Dispatch, EventRouter};
use crate::turn::{Phase, Turn};
use crate::typewriter::{DisplayFrame, Typewriter};

const CLOSED_EARLY: &str = "stream closed before the turn completed";

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The turn reached Done.
    Completed,
    /// The turn reached Errored with this message.
    Errored(String),
    /// The session was stopped.
    Cancelled(AbortReason),
    /// The stream ended without a terminal event.
    EndOfInput,
}

/// Everything the caller needs once a session is over.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Final snapshot of the session's Turn.
    pub turn: Turn,
    pub end: SessionEnd,
    /// Malformed records skipped along the way.
    pub decode_errors: usize,
    /// Transient flags after the exit path ran.
    pub flags: TransientFlags,
    /// The end-of-input watchdog had to clear the flags.
    pub watchdog_fired: bool,
}

/// Starts stream sessions against one transport.
#[derive(Clone)]
pub struct FlowOrchestrator {
    transport: Arc<dyn TurnTransport>,
    config: StreamConfig,
}

impl FlowOrchestrator {
    pub fn new(transport: Arc<dyn TurnTransport>, config: StreamConfig) -> Self {
        Self { transport, config }
    }

    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Prepares a session and arms its cancellation controller.
    ///
    /// Nothing is sent until [`StreamSession::run`]; subscribe to turns and
    /// frames in between. Must be called inside a Tokio runtime.
    pub fn start(
        &self,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        options: StreamOptions,
    ) -> StreamSession {
        StreamSession {
            transport: Arc::clone(&self.transport),
            request: StreamRequest::new(conversation_id, content, options),
            controller: CancellationController::start(self.config.budget()),
            router: EventRouter::new(),
            typewriter: Typewriter::new(self.config.typewriter_config()),
            watchdog_grace: self.config.watchdog_grace(),
            fatal: None,
            watchdog_fired: false,
        }
    }

    /// Starts a session and runs it to completion.
    pub async fn send(
        &self,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        options: StreamOptions,
    ) -> Result<SessionOutcome, StreamError> {
        self.start(conversation_id, content, options).run().await
    }
}

enum Step {
    Cancelled(AbortReason),
    Next(Option<Result<StreamEvent, StreamError>>),
}

/// One turn's network lifecycle.
pub struct StreamSession {
    transport: Arc<dyn TurnTransport>,
    request: StreamRequest,
    controller: CancellationController,
    router: EventRouter,
    typewriter: Typewriter,
    watchdog_grace: Duration,
    fatal: Option<StreamError>,
    watchdog_fired: bool,
}

impl StreamSession {
    /// The request this session sends.
    #[must_use]
    pub const fn request(&self) -> &StreamRequest {
        &self.request
    }

    /// Handle for stopping the session from elsewhere (UI, signal handler).
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.controller.handle()
    }

    /// Committed Turn snapshots, one per applied event.
    pub fn subscribe_turns(&self) -> broadcast::Receiver<Turn> {
        self.router.subscribe()
    }

    /// Typewriter frames.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<DisplayFrame> {
        self.typewriter.subscribe()
    }

    /// Drives the session until the turn ends, the stream ends, or it is cancelled.
    ///
    /// # Errors
    /// Returns an error only when the session ends before the server created
    /// a Turn, since there is no Turn to carry the outcome. Everything after
    /// that is reported through [`SessionOutcome::end`].
    pub async fn run(mut self) -> Result<SessionOutcome, StreamError> {
        info!(
            conversation_id = %self.request.conversation_id,
            transport = self.transport.name(),
            model = %self.request.model_id,
            "Starting stream session"
        );
        let handle = self.controller.handle();
        let end = self.drive(&handle).await;
        self.finish(end)
    }

    async fn drive(&mut self, handle: &CancelHandle) -> SessionEnd {
        let opened = tokio::select! {
            biased;
            reason = handle.cancelled() => return SessionEnd::Cancelled(reason),
            opened = self.transport.open(&self.request) => opened,
        };
        let bytes = match opened {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "Failed to open event stream");
                return self.fail(StreamError::Transport(err));
            }
        };

        let mut events = EventStream::new(bytes);
        loop {
            let step = tokio::select! {
                biased;
                reason = handle.cancelled() => Step::Cancelled(reason),
                next = events.next() => Step::Next(next),
            };
            match step {
                Step::Cancelled(reason) => return self.cancel(reason),
                Step::Next(None) => return self.end_of_input(handle).await,
                Step::Next(Some(Err(StreamError::Decode(err)))) => self.router.note_decode_error(&err),
                Step::Next(Some(Err(err))) => {
                    error!(error = %err, "Event stream failed");
                    return self.fail(err);
                }
                Step::Next(Some(Ok(event))) => match self.router.dispatch(event) {
                    Ok(dispatch) => {
                        self.show(&dispatch);
                        if let Some(end) = self.terminal_end() {
                            return end;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "Event could not be applied");
                        return self.fail(err);
                    }
                },
            }
        }
    }

    fn show(&mut self, dispatch: &Dispatch) {
        if let Some(change) = dispatch.content_change() {
            let animation = self.typewriter.animate(&change.turn_id, &change.from, &change.to);
            debug!(turn_id = %change.turn_id, animation = ?animation, "Content changed");
        }
    }

    fn terminal_end(&self) -> Option<SessionEnd> {
        let turn = self.router.active()?;
        match turn.phase() {
            Phase::Done => Some(SessionEnd::Completed),
            Phase::Errored => Some(SessionEnd::Errored(turn.error().unwrap_or_default().to_string())),
            _ => None,
        }
    }

    fn cancel(&mut self, reason: AbortReason) -> SessionEnd {
        if let Some(dispatch) = self.router.cancel(reason) {
            self.show(&dispatch);
        }
        SessionEnd::Cancelled(reason)
    }

    fn fail(&mut self, err: StreamError) -> SessionEnd {
        let message = err.to_string();
        if let Some(dispatch) = self.router.fail(&message) {
            self.show(&dispatch);
        }
        self.fatal = Some(err);
        SessionEnd::Errored(message)
    }

    async fn end_of_input(&mut self, handle: &CancelHandle) -> SessionEnd {
        if self.router.flags().any() {
            warn!(
                grace_ms = self.watchdog_grace.as_millis() as u64,
                "Stream ended with transient flags still set; arming watchdog"
            );
            let cancelled = tokio::select! {
                () = tokio::time::sleep(self.watchdog_grace) => None,
                reason = handle.cancelled() => Some(reason),
            };
            if let Some(reason) = cancelled {
                return self.cancel(reason);
            }
            if self.router.flags_mut().clear_once() {
                warn!("Watchdog force-cleared transient flags");
                self.watchdog_fired = true;
            }
        }
        if let Some(dispatch) = self.router.fail(CLOSED_EARLY) {
            self.show(&dispatch);
        }
        SessionEnd::EndOfInput
    }

    fn finish(mut self, end: SessionEnd) -> Result<SessionOutcome, StreamError> {
        self.controller.disarm();

        let Some(turn) = self.router.active().cloned() else {
            self.router.flags_mut().clear_once();
            warn!(end = ?end, "Stream session ended before a turn was created");
            return Err(match end {
                SessionEnd::Cancelled(reason) => StreamError::Aborted(reason),
                _ => self.fatal.take().unwrap_or_else(|| StreamError::Handler(CLOSED_EARLY.to_string())),
            });
        };

        // A completed turn keeps revealing after the session returns.
        if end == SessionEnd::Completed && self.typewriter.release(turn.id()) {
            debug!(turn_id = %turn.id(), "Reveal continues past session end");
        } else {
            self.typewriter.snap(turn.id(), turn.visible_content());
        }

        let cleared = self.router.flags_mut().clear_once();
        debug!(turn_id = %turn.id(), cleared, "Exit path ran");
        info!(
            turn_id = %turn.id(),
            phase = ?turn.phase(),
            end = ?end,
            decode_errors = self.router.decode_errors(),
            "Stream session finished"
        );

        Ok(SessionOutcome {
            turn,
            end,
            decode_errors: self.router.decode_errors(),
            flags: *self.router.flags(),
            watchdog_fired: self.watchdog_fired,
        })
    }
}
