//! Event router.
//!
//! Dispatches each decoded event to exactly one handler through an
//! exhaustive match. Handlers build a [`TurnPatch`] for the addressed Turn
//! and the router applies it to the [`MessageStore`], which it owns. The
//! router is the single writer; everything else reads snapshots.
//!
//! Events addressing a Turn that was never created, or one that already
//! reached a terminal phase, are dropped without touching the store.

use tessera_abstraction::{AbortReason, DecodeError, StreamError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::event::StreamEvent;
use crate::flags::TransientFlags;
use crate::lock::{CommitPermit, ContentDecision, ContentWrite};
use crate::store::{MessageStore, ToolSection, TurnPatch};
use crate::turn::{
    LockState, LockedContainer, Phase, ToolOutcomeUpdate, ToolStatus, Turn, TurnId, progress_percent,
};

/// A visible-content change produced by one dispatch, for the typewriter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub turn_id: TurnId,
    /// Visible content before the event.
    pub from: String,
    /// Visible content after the event.
    pub to: String,
}

/// Why an event was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event type is not known to this client.
    UnknownEvent(String),
    /// The event carried no turn id and no Turn is active yet.
    NoActiveTurn,
    /// The event addressed a Turn that was never created.
    UnknownTurn(TurnId),
    /// The addressed Turn is already Done, Errored or Cancelled.
    TerminalTurn(TurnId),
    /// `turn-created` repeated for the active Turn.
    DuplicateTurnCreated,
}

/// Result of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The event was applied to `turn_id`.
    Applied {
        turn_id: TurnId,
        /// Set when the visible content changed.
        content: Option<ContentChange>,
    },
    /// The event was dropped.
    Ignored { reason: IgnoreReason },
}

impl Dispatch {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// The visible-content change, if any.
    #[must_use]
    pub const fn content_change(&self) -> Option<&ContentChange> {
        match self {
            Self::Applied { content, .. } => content.as_ref(),
            Self::Ignored { .. } => None,
        }
    }
}

/// Single-writer dispatcher over the message store.
#[derive(Debug, Default)]
pub struct EventRouter {
    store: MessageStore,
    active_turn: Option<TurnId>,
    flags: TransientFlags,
    decode_errors: usize,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the store.
    #[must_use]
    pub const fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Subscribes to committed Turn snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Turn> {
        self.store.subscribe()
    }

    /// The session's Turn, once `turn-created` arrived.
    #[must_use]
    pub const fn active_turn(&self) -> Option<&TurnId> {
        self.active_turn.as_ref()
    }

    /// Snapshot of the session's Turn.
    #[must_use]
    pub fn active(&self) -> Option<&Turn> {
        self.active_turn.as_ref().and_then(|id| self.store.get(id))
    }

    #[must_use]
    pub const fn flags(&self) -> &TransientFlags {
        &self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut TransientFlags {
        &mut self.flags
    }

    /// Number of malformed records seen so far.
    #[must_use]
    pub const fn decode_errors(&self) -> usize {
        self.decode_errors
    }

    /// Dispatches one event to its handler.
    ///
    /// `Err` means the event could not be applied and the turn must end
    /// (a protocol violation). Dropped events are `Ok(Dispatch::Ignored)`.
    pub fn dispatch(&mut self, event: StreamEvent) -> Result<Dispatch, StreamError> {
        debug!(
            event = event.event_type(),
            turn_id = event.turn_id().map(TurnId::as_str),
            "Dispatching event"
        );

        let dispatch = match event {
            StreamEvent::TurnCreated(e) => self.on_turn_created(e.turn_id)?,

            StreamEvent::TextDelta(e) => self.apply(Some(e.turn_id), |_| {
                let mut patch = TurnPatch::new()
                    .content(ContentWrite::Stream(e.content))
                    .phase(Phase::StreamingText)
                    .usage(e.tokens_used, None);
                if let Some(thinking) = e.thinking_content {
                    patch = patch.thinking(thinking);
                }
                Ok(patch)
            })?,

            StreamEvent::ThinkingDelta(e) => self.apply(Some(e.turn_id), |_| {
                Ok(TurnPatch::new().thinking(e.content).phase(Phase::StreamingText))
            })?,

            StreamEvent::ToolsDetected(e) => self.apply(Some(e.turn_id), |_| {
                let names: Vec<&str> = e.tools.iter().map(|t| t.name.as_str()).collect();
                let status = format!("Running {}", names.join(", "));
                Ok(TurnPatch::new().tool_invocations(e.tools).phase(Phase::ToolsDetected).status_text(status))
            })?,

            StreamEvent::ToolExecHeartbeat(e) => self.apply(Some(e.turn_id), |_| {
                let progress = e.progress.map(progress_percent);
                let mut patch = TurnPatch::new()
                    .phase(Phase::ExecutingTools)
                    .progress(progress)
                    .status_text(e.message.clone());
                if let Some(index) = e.tool_index {
                    patch = patch.tool_outcome(ToolOutcomeUpdate {
                        index,
                        status: ToolStatus::Running,
                        status_text: Some(e.message),
                        progress,
                    });
                }
                Ok(patch)
            })?,

            StreamEvent::ToolExecError(e) => self.apply(Some(e.turn_id), |turn| {
                let tool = e
                    .tool_name
                    .clone()
                    .or_else(|| {
                        let index = e.tool_index?;
                        turn.tool_invocations()?.get(index).map(|t| t.name.clone())
                    })
                    .unwrap_or_else(|| "tool".to_string());
                let err = StreamError::ToolExecution { tool, message: e.error.clone() };
                warn!(turn_id = %turn.id(), error = %err, "Tool invocation failed");

                let mut patch = TurnPatch::new().phase(Phase::ExecutingTools).status_text(err.to_string());
                if let Some(index) = e.tool_index {
                    patch = patch.tool_outcome(ToolOutcomeUpdate {
                        index,
                        status: ToolStatus::Failed,
                        status_text: Some(e.error),
                        progress: None,
                    });
                }
                Ok(patch)
            })?,

            StreamEvent::ToolResultSection(e) => self.apply(Some(e.turn_id), |_| {
                if e.section_index >= e.section_total {
                    return Err(StreamError::Handler(format!(
                        "tool result section {} out of range for total {}",
                        e.section_index, e.section_total
                    )));
                }
                Ok(TurnPatch::new()
                    .tool_section(ToolSection {
                        index: e.section_index,
                        total: e.section_total,
                        content: e.section_content,
                    })
                    .phase(Phase::ExecutingTools)
                    .progress(e.progress.map(progress_percent)))
            })?,

            StreamEvent::ToolsCommitted(e) => {
                let dispatch = self.apply(Some(e.turn_id), |turn| {
                    let formatted = e.formatted_result.as_deref();
                    if turn.lock_state() == LockState::Locked {
                        // The guard rejects this and logs it.
                        let container = LockedContainer::from_result(&e.final_result, formatted, "");
                        return Ok(TurnPatch::new().content(ContentWrite::Commit(CommitPermit::new(container))));
                    }
                    let results = turn.tool_results();
                    if results.section_total().is_some() && !results.is_complete() {
                        debug!(
                            turn_id = %turn.id(),
                            received = results.sections_received(),
                            total = results.section_total(),
                            "Committing with missing sections"
                        );
                    }
                    let container = LockedContainer::from_result(&e.final_result, formatted, &results.assembled());
                    Ok(TurnPatch::new()
                        .content(ContentWrite::Commit(CommitPermit::new(container)))
                        .commit_result(e.final_result, e.formatted_result)
                        .phase(Phase::ToolsLocked))
                })?;
                // A summary that started early holds the phase past ToolsLocked.
                if dispatch.is_applied() {
                    self.flags.lower_processing();
                }
                dispatch
            }

            StreamEvent::SummaryStarted(e) => self.apply(e.turn_id, |_| {
                Ok(TurnPatch::new().phase(Phase::Summarizing).status_text("Summarizing results"))
            })?,

            StreamEvent::SummaryDelta(e) => self.apply(e.turn_id, |_| {
                Ok(TurnPatch::new()
                    .content(ContentWrite::Summary(e.content))
                    .phase(Phase::Summarizing)
                    .progress(e.progress.map(progress_percent)))
            })?,

            StreamEvent::SummaryDone(e) => {
                let dispatch = self.apply(e.turn_id, |_| {
                    Ok(TurnPatch::new()
                        .content(ContentWrite::Summary(e.full_content))
                        .phase(Phase::Summarizing)
                        .progress(Some(100)))
                })?;
                if dispatch.is_applied() {
                    self.flags.lower_summary();
                }
                dispatch
            }

            StreamEvent::SummaryError(e) => {
                let dispatch = self.apply(e.turn_id, |turn| {
                    let err = StreamError::Summary(e.error.clone());
                    warn!(turn_id = %turn.id(), error = %err, "Summary failed; keeping tool results");
                    Ok(TurnPatch::new()
                        .summary_error(e.error.clone())
                        .status_text(format!("Summary unavailable: {}", e.error)))
                })?;
                if dispatch.is_applied() {
                    self.flags.lower_summary();
                }
                dispatch
            }

            StreamEvent::TurnDone(e) => self.apply(Some(e.turn_id), |_| {
                let snapshot = e.updated_turn.unwrap_or_default();
                let mut patch = TurnPatch::new()
                    .usage(snapshot.tokens_used.or(e.tokens_used), snapshot.cost.or(e.cost))
                    .phase(Phase::Done);
                if !e.full_content.is_empty() {
                    patch = patch.content(ContentWrite::Stream(e.full_content));
                }
                Ok(patch)
            })?,

            StreamEvent::TurnError(e) => {
                if e.turn_id.is_none() && self.active_turn.is_none() {
                    error!(error = %e.error, "Turn failed before it was created");
                    return Err(StreamError::TurnFailed(e.error));
                }
                self.apply(e.turn_id, |_| Ok(Self::error_patch(&e.error)))?
            }

            StreamEvent::Unknown(name) => {
                Dispatch::Ignored { reason: IgnoreReason::UnknownEvent(name) }
            }
        };

        if let Dispatch::Ignored { reason } = &dispatch {
            match reason {
                IgnoreReason::UnknownEvent(name) => warn!(event = %name, "Dropping unknown event"),
                IgnoreReason::UnknownTurn(id) => warn!(turn_id = %id, "Dropping event for unknown turn"),
                IgnoreReason::NoActiveTurn => warn!("Dropping event received before turn-created"),
                IgnoreReason::TerminalTurn(id) => debug!(turn_id = %id, "Dropping event for finished turn"),
                IgnoreReason::DuplicateTurnCreated => debug!("Ignoring repeated turn-created"),
            }
        }
        Ok(dispatch)
    }

    /// Records a malformed record and surfaces it inline on the active Turn.
    pub fn note_decode_error(&mut self, error: &DecodeError) {
        self.decode_errors += 1;
        warn!(error = %error, count = self.decode_errors, "Skipping malformed record");
        if let Some(turn_id) = self.live_turn() {
            self.store.upsert(&turn_id, TurnPatch::new().status_text(format!("Skipped a malformed event: {error}")));
        }
    }

    /// Moves the active Turn to Cancelled. `None` if there is no live Turn.
    pub fn cancel(&mut self, reason: AbortReason) -> Option<Dispatch> {
        let turn_id = self.live_turn()?;
        info!(turn_id = %turn_id, reason = %reason, "Turn cancelled");
        Some(self.commit(turn_id, TurnPatch::new().phase(Phase::Cancelled).status_text(reason.label())))
    }

    /// Moves the active Turn to Errored with `message` as its visible notice.
    pub fn fail(&mut self, message: &str) -> Option<Dispatch> {
        let turn_id = self.live_turn()?;
        Some(self.commit(turn_id, Self::error_patch(message)))
    }

    fn error_patch(message: &str) -> TurnPatch {
        TurnPatch::new()
            .content(ContentWrite::ErrorNotice(format!("Error: {message}")))
            .error(message)
            .phase(Phase::Errored)
    }

    fn on_turn_created(&mut self, turn_id: TurnId) -> Result<Dispatch, StreamError> {
        match &self.active_turn {
            Some(active) if *active == turn_id => {
                Ok(Dispatch::Ignored { reason: IgnoreReason::DuplicateTurnCreated })
            }
            Some(active) => Err(StreamError::Handler(format!(
                "turn '{turn_id}' created while turn '{active}' is in flight"
            ))),
            None => {
                info!(turn_id = %turn_id, "Turn created");
                self.active_turn = Some(turn_id.clone());
                self.flags.raise_streaming();
                Ok(self.commit(turn_id, TurnPatch::new()))
            }
        }
    }

    /// Resolves the addressed Turn, then builds and commits its patch.
    fn apply(
        &mut self,
        target: Option<TurnId>,
        build: impl FnOnce(&Turn) -> Result<TurnPatch, StreamError>,
    ) -> Result<Dispatch, StreamError> {
        let Some(turn_id) = target.or_else(|| self.active_turn.clone()) else {
            return Ok(Dispatch::Ignored { reason: IgnoreReason::NoActiveTurn });
        };
        let patch = match self.store.get(&turn_id) {
            None => return Ok(Dispatch::Ignored { reason: IgnoreReason::UnknownTurn(turn_id) }),
            Some(turn) if turn.phase().is_terminal() => {
                return Ok(Dispatch::Ignored { reason: IgnoreReason::TerminalTurn(turn_id) });
            }
            Some(turn) => build(turn)?,
        };
        Ok(self.commit(turn_id, patch))
    }

    fn commit(&mut self, turn_id: TurnId, patch: TurnPatch) -> Dispatch {
        let outcome = self.store.upsert(&turn_id, patch);
        if outcome.phase_changed
            && let Some(turn) = self.store.get(&turn_id)
        {
            self.flags.follow(turn.phase());
        }
        let content = match outcome.content {
            Some(ContentDecision::Accepted { previous, current }) => {
                Some(ContentChange { turn_id: turn_id.clone(), from: previous, to: current })
            }
            _ => None,
        };
        Dispatch::Applied { turn_id, content }
    }

    fn live_turn(&self) -> Option<TurnId> {
        let turn = self.active()?;
        (!turn.phase().is_terminal()).then(|| turn.id().clone())
    }
}
