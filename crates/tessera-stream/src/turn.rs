//! The Turn record: one assistant response cycle and its phase machine.
//!
//! Fields are private. Reads go through accessors; writes go through
//! [`MessageStore::upsert`](crate::store::MessageStore::upsert) so the
//! content lock and the phase ordering cannot be bypassed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Server-assigned identifier of a Turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

impl TurnId {
    /// Wraps a server-assigned id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TurnId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TurnId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Where a Turn is in its lifecycle.
///
/// Phases advance in declaration order up to `Done`. `Errored` and
/// `Cancelled` are reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The server created the turn record.
    Created,
    /// Plain text is streaming.
    StreamingText,
    /// The model requested tool invocations.
    ToolsDetected,
    /// Tools are running.
    ExecutingTools,
    /// The tool result has been committed and the content locked.
    ToolsLocked,
    /// A second model pass is summarizing the tool output.
    Summarizing,
    /// The turn finished normally.
    Done,
    /// The turn failed.
    Errored,
    /// The turn was stopped by the user or its budget.
    Cancelled,
}

impl Phase {
    /// Returns `true` for `Done`, `Errored` and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::StreamingText => 1,
            Self::ToolsDetected => 2,
            Self::ExecutingTools => 3,
            Self::ToolsLocked => 4,
            Self::Summarizing => 5,
            Self::Done | Self::Errored | Self::Cancelled => 6,
        }
    }

    /// Checks if the turn can move from this phase to `to`.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Self::Errored | Self::Cancelled => true,
            _ => to.rank() >= self.rank(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::StreamingText => "streaming",
            Self::ToolsDetected => "tools detected",
            Self::ExecutingTools => "executing tools",
            Self::ToolsLocked => "tools locked",
            Self::Summarizing => "summarizing",
            Self::Done => "done",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Whether plain-text streaming may still write the visible content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Plain-text writes are accepted.
    #[default]
    Open,
    /// A tool result is committed; only the summary slot may change.
    Locked,
}

/// A structured request to an external capability. Immutable once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Tool name.
    pub name: String,
    /// Arguments as sent by the model.
    #[serde(default, alias = "args")]
    pub arguments: Value,
}

impl ToolInvocation {
    /// Creates an invocation.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self { name: name.into(), arguments }
    }
}

/// Execution status of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Not started yet.
    #[default]
    Pending,
    /// Heartbeats are arriving.
    Running,
    /// The result was committed.
    Completed,
    /// The invocation failed.
    Failed,
}

/// Progress of one invocation, aligned by index with the invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolOutcome {
    /// Current status.
    pub status: ToolStatus,
    /// Latest status line (heartbeat message or error).
    pub status_text: Option<String>,
    /// Latest progress, 0-100.
    pub progress: Option<u8>,
}

/// An update to one [`ToolOutcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcomeUpdate {
    /// Index into the invocation list.
    pub index: usize,
    /// New status.
    pub status: ToolStatus,
    /// New status line.
    pub status_text: Option<String>,
    /// New progress, 0-100.
    pub progress: Option<u8>,
}

/// Tool results as they evolve: indexed sections first, the committed value last.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolResults {
    outcomes: Vec<ToolOutcome>,
    sections: BTreeMap<u32, String>,
    section_total: Option<u32>,
    final_result: Option<Value>,
    formatted_result: Option<String>,
}

impl ToolResults {
    /// Per-invocation outcomes, aligned with the invocations.
    #[must_use]
    pub fn outcomes(&self) -> &[ToolOutcome] {
        &self.outcomes
    }

    /// Number of sections the server announced, if any arrived.
    #[must_use]
    pub const fn section_total(&self) -> Option<u32> {
        self.section_total
    }

    /// Number of distinct sections received so far.
    #[must_use]
    pub fn sections_received(&self) -> usize {
        self.sections.len()
    }

    /// Returns `true` once every announced section has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.section_total.is_some_and(|total| self.sections.len() == total as usize)
    }

    /// Received sections concatenated in index order, regardless of arrival order.
    #[must_use]
    pub fn assembled(&self) -> String {
        self.sections.values().map(String::as_str).collect()
    }

    /// The committed result value.
    #[must_use]
    pub const fn final_result(&self) -> Option<&Value> {
        self.final_result.as_ref()
    }

    /// The committed, pre-formatted result text.
    #[must_use]
    pub fn formatted_result(&self) -> Option<&str> {
        self.formatted_result.as_deref()
    }

    pub(crate) fn align(&mut self, invocations: usize) {
        self.outcomes.resize_with(invocations, ToolOutcome::default);
    }

    pub(crate) fn insert_section(&mut self, index: u32, total: u32, content: String) {
        self.section_total = Some(self.section_total.map_or(total, |known| known.max(total)));
        self.sections.insert(index, content);
    }

    pub(crate) fn update_outcome(&mut self, update: ToolOutcomeUpdate) -> bool {
        let Some(outcome) = self.outcomes.get_mut(update.index) else {
            return false;
        };
        // A failed invocation stays failed.
        if outcome.status != ToolStatus::Failed {
            outcome.status = update.status;
        }
        if update.status_text.is_some() {
            outcome.status_text = update.status_text;
        }
        if let Some(progress) = update.progress {
            outcome.progress = Some(outcome.progress.map_or(progress, |p| p.max(progress)));
        }
        true
    }

    pub(crate) fn commit(&mut self, final_result: Value, formatted: Option<String>) {
        for outcome in &mut self.outcomes {
            if outcome.status != ToolStatus::Failed {
                outcome.status = ToolStatus::Completed;
            }
        }
        self.final_result = Some(final_result);
        self.formatted_result = formatted;
    }
}

const SUMMARY_DIVIDER: &str = "\n\n---\n\n";

/// The visible content of a locked Turn: committed tool output plus a
/// reserved hole that only the summary handlers may fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockedContainer {
    tool_content: String,
    summary: String,
}

impl LockedContainer {
    /// Builds the container from a committed tool result.
    ///
    /// Preference order: the server-formatted text, a string result as-is,
    /// the assembled sections when the result is null, pretty JSON otherwise.
    #[must_use]
    pub fn from_result(final_result: &Value, formatted: Option<&str>, assembled: &str) -> Self {
        let tool_content = match (formatted, final_result) {
            (Some(text), _) if !text.is_empty() => text.to_string(),
            (_, Value::String(text)) => text.clone(),
            (_, Value::Null) => assembled.to_string(),
            (_, other) => {
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
            }
        };
        Self { tool_content, summary: String::new() }
    }

    /// The committed tool output.
    #[must_use]
    pub fn tool_content(&self) -> &str {
        &self.tool_content
    }

    /// The summary slot.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Renders the container as the Turn's visible content.
    #[must_use]
    pub fn render(&self) -> String {
        if self.summary.is_empty() {
            self.tool_content.clone()
        } else {
            format!("{}{SUMMARY_DIVIDER}{}", self.tool_content, self.summary)
        }
    }

    pub(crate) fn set_summary(&mut self, summary: String) {
        self.summary = summary;
    }
}

/// One assistant response cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    id: TurnId,
    visible_content: String,
    thinking_content: Option<String>,
    tool_invocations: Option<Vec<ToolInvocation>>,
    tool_results: ToolResults,
    summary: Option<String>,
    container: Option<LockedContainer>,
    lock_state: LockState,
    phase: Phase,
    progress: Option<u8>,
    status_text: Option<String>,
    tokens_used: Option<u64>,
    cost: Option<f64>,
    error: Option<String>,
    summary_error: Option<String>,
}

impl Turn {
    /// Role of every Turn this subsystem tracks.
    pub const ROLE: &'static str = "assistant";

    /// Creates a Turn in phase `Created` with open, empty content.
    #[must_use]
    pub fn new(id: TurnId) -> Self {
        Self {
            id,
            visible_content: String::new(),
            thinking_content: None,
            tool_invocations: None,
            tool_results: ToolResults::default(),
            summary: None,
            container: None,
            lock_state: LockState::Open,
            phase: Phase::Created,
            progress: None,
            status_text: None,
            tokens_used: None,
            cost: None,
            error: None,
            summary_error: None,
        }
    }

    /// Server-assigned id.
    #[must_use]
    pub const fn id(&self) -> &TurnId {
        &self.id
    }

    /// Always `"assistant"`.
    #[must_use]
    pub const fn role(&self) -> &'static str {
        Self::ROLE
    }

    /// Text shown to the user.
    #[must_use]
    pub fn visible_content(&self) -> &str {
        &self.visible_content
    }

    /// Side-channel reasoning text.
    #[must_use]
    pub fn thinking_content(&self) -> Option<&str> {
        self.thinking_content.as_deref()
    }

    /// Tool invocations, once detected.
    #[must_use]
    pub fn tool_invocations(&self) -> Option<&[ToolInvocation]> {
        self.tool_invocations.as_deref()
    }

    /// Tool results as assembled so far.
    #[must_use]
    pub const fn tool_results(&self) -> &ToolResults {
        &self.tool_results
    }

    /// Summary text from the second model pass.
    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// The locked container, once tools are committed.
    #[must_use]
    pub const fn container(&self) -> Option<&LockedContainer> {
        self.container.as_ref()
    }

    /// Content lock state.
    #[must_use]
    pub const fn lock_state(&self) -> LockState {
        self.lock_state
    }

    /// Lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Progress within the current phase, 0-100.
    #[must_use]
    pub const fn progress(&self) -> Option<u8> {
        self.progress
    }

    /// Latest inline status line.
    #[must_use]
    pub fn status_text(&self) -> Option<&str> {
        self.status_text.as_deref()
    }

    /// Tokens used, as reported by the server.
    #[must_use]
    pub const fn tokens_used(&self) -> Option<u64> {
        self.tokens_used
    }

    /// Cost, as reported by the server.
    #[must_use]
    pub const fn cost(&self) -> Option<f64> {
        self.cost
    }

    /// Terminal error message, if the turn errored.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Summary failure message, if the summarization pass failed.
    #[must_use]
    pub fn summary_error(&self) -> Option<&str> {
        self.summary_error.as_deref()
    }

    /// Moves to `to` if the transition is allowed. Progress resets on change.
    pub(crate) fn advance_phase(&mut self, to: Phase) -> bool {
        if self.phase == to {
            return false;
        }
        if !self.phase.can_transition_to(to) {
            debug!(turn_id = %self.id, from = ?self.phase, to = ?to, "Ignoring backward phase transition");
            return false;
        }
        debug!(turn_id = %self.id, from = ?self.phase, to = ?to, "Phase transition");
        self.phase = to;
        self.progress = None;
        true
    }

    /// Records progress; monotonic within a phase.
    pub(crate) fn set_progress(&mut self, value: u8) {
        let value = value.min(100);
        if self.progress.is_none_or(|current| value >= current) {
            self.progress = Some(value);
        }
    }

    /// Sets the invocations once. Returns `false` if they were already set.
    pub(crate) fn set_tool_invocations(&mut self, invocations: Vec<ToolInvocation>) -> bool {
        if self.tool_invocations.is_some() {
            return false;
        }
        self.tool_results.align(invocations.len());
        self.tool_invocations = Some(invocations);
        true
    }

    /// Writes cumulative thinking text; never subject to the content lock.
    pub(crate) fn set_thinking(&mut self, thinking: String) -> bool {
        let current = self.thinking_content.as_deref().unwrap_or_default();
        if thinking.len() < current.len() || thinking == current {
            return false;
        }
        self.thinking_content = Some(thinking);
        true
    }

    pub(crate) fn set_status_text(&mut self, text: String) {
        self.status_text = Some(text);
    }

    pub(crate) fn set_usage(&mut self, tokens_used: Option<u64>, cost: Option<f64>) {
        if tokens_used.is_some() {
            self.tokens_used = tokens_used;
        }
        if cost.is_some() {
            self.cost = cost;
        }
    }

    pub(crate) fn set_error(&mut self, error: String) {
        self.error = Some(error);
    }

    pub(crate) fn set_summary_error(&mut self, error: String) {
        self.summary_error = Some(error);
    }

    pub(crate) fn tool_results_mut(&mut self) -> &mut ToolResults {
        &mut self.tool_results
    }

    // Raw content access, reserved for the content lock guard.

    pub(crate) fn replace_visible(&mut self, content: String) {
        self.visible_content = content;
    }

    pub(crate) fn lock_with(&mut self, container: LockedContainer) {
        self.visible_content = container.render();
        self.container = Some(container);
        self.lock_state = LockState::Locked;
    }

    pub(crate) fn set_summary(&mut self, summary: String) {
        self.summary = Some(summary);
    }

    pub(crate) fn container_mut(&mut self) -> Option<&mut LockedContainer> {
        self.container.as_mut()
    }
}

/// Converts a wire progress value to a clamped percentage.
#[must_use]
pub fn progress_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 100.0).round() as u8
}
