//! Content lock guard.
//!
//! The only code allowed to change a Turn's visible content. While the turn
//! is open, streamed text grows the content. The tools-committed handler
//! locks it exactly once by swapping in a [`LockedContainer`]; after that only
//! the summary slot inside the container can change. Rejected writes are
//! expected races between trailing narration and tool completion, so they
//! are logged and reported as a decision, never as an error.

use tracing::{debug, warn};

use crate::turn::{LockState, LockedContainer, Turn};

/// Proof that the caller is the tools-committed handler.
///
/// Only the event router can mint one, so no other path can lock a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPermit {
    container: LockedContainer,
}

impl CommitPermit {
    pub(crate) fn new(container: LockedContainer) -> Self {
        Self { container }
    }

    /// The container this permit will install.
    #[must_use]
    pub const fn container(&self) -> &LockedContainer {
        &self.container
    }
}

/// A requested change to a Turn's visible content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentWrite {
    /// Cumulative plain text (text-delta, turn-done full content).
    Stream(String),
    /// The single wholesale replace that locks the turn.
    Commit(CommitPermit),
    /// Cumulative summary text for the reserved slot.
    Summary(String),
    /// An error message appended to open content when the turn fails.
    ErrorNotice(String),
}

impl ContentWrite {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Stream(_) => "stream",
            Self::Commit(_) => "commit",
            Self::Summary(_) => "summary",
            Self::ErrorNotice(_) => "error_notice",
        }
    }
}

/// Why a write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The turn is locked and the write is not a summary write.
    Locked,
    /// A second commit was attempted.
    AlreadyLocked,
    /// The write would shrink the content.
    Regression,
    /// The turn has reached a terminal phase.
    Terminal,
}

/// Outcome of a content write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentDecision {
    /// The visible content changed.
    Accepted {
        /// Visible content before the write.
        previous: String,
        /// Visible content after the write.
        current: String,
    },
    /// The write was allowed but left the visible content as it was.
    Unchanged,
    /// The write was refused.
    Rejected(RejectReason),
}

impl ContentDecision {
    /// Returns `true` if the visible content changed.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Returns `true` if the write was refused.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// The sole authority over a Turn's visible content.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentLock;

impl ContentLock {
    /// Applies `write` to `turn` if the lock allows it.
    pub fn apply(turn: &mut Turn, write: ContentWrite) -> ContentDecision {
        let kind = write.kind();
        let decision = if turn.phase().is_terminal() {
            ContentDecision::Rejected(RejectReason::Terminal)
        } else {
            match (turn.lock_state(), write) {
                (LockState::Open, ContentWrite::Stream(text)) => Self::grow(turn, text),
                (LockState::Open, ContentWrite::ErrorNotice(message)) => {
                    let text = if turn.visible_content().is_empty() {
                        message
                    } else {
                        format!("{}\n\n{message}", turn.visible_content())
                    };
                    Self::grow(turn, text)
                }
                (LockState::Open, ContentWrite::Commit(permit)) => {
                    let previous = turn.visible_content().to_string();
                    turn.lock_with(permit.container);
                    ContentDecision::Accepted { previous, current: turn.visible_content().to_string() }
                }
                (LockState::Open, ContentWrite::Summary(text)) => {
                    // No container yet: the summary is kept but not shown.
                    Self::store_summary(turn, text);
                    ContentDecision::Unchanged
                }
                (LockState::Locked, ContentWrite::Summary(text)) => Self::fill_summary(turn, text),
                (LockState::Locked, ContentWrite::Commit(_)) => {
                    ContentDecision::Rejected(RejectReason::AlreadyLocked)
                }
                (LockState::Locked, ContentWrite::Stream(_) | ContentWrite::ErrorNotice(_)) => {
                    ContentDecision::Rejected(RejectReason::Locked)
                }
            }
        };

        match &decision {
            ContentDecision::Rejected(RejectReason::AlreadyLocked) => {
                warn!(turn_id = %turn.id(), write = kind, "Rejected second commit on locked turn");
            }
            ContentDecision::Rejected(reason) => {
                debug!(turn_id = %turn.id(), write = kind, reason = ?reason, "Content write rejected");
            }
            ContentDecision::Accepted { current, .. } => {
                debug!(turn_id = %turn.id(), write = kind, len = current.len(), "Content write accepted");
            }
            ContentDecision::Unchanged => {}
        }
        decision
    }

    /// Only length is guarded; a same-length or longer rewrite replaces the content.
    fn grow(turn: &mut Turn, text: String) -> ContentDecision {
        let current = turn.visible_content();
        if text.len() < current.len() {
            return ContentDecision::Rejected(RejectReason::Regression);
        }
        if text == current {
            return ContentDecision::Unchanged;
        }
        let previous = current.to_string();
        turn.replace_visible(text.clone());
        ContentDecision::Accepted { previous, current: text }
    }

    fn store_summary(turn: &mut Turn, text: String) -> bool {
        let current_len = turn.summary().map_or(0, str::len);
        if text.len() < current_len || turn.summary() == Some(text.as_str()) {
            return false;
        }
        turn.set_summary(text);
        true
    }

    fn fill_summary(turn: &mut Turn, text: String) -> ContentDecision {
        if !Self::store_summary(turn, text.clone()) {
            return if turn.summary() == Some(text.as_str()) {
                ContentDecision::Unchanged
            } else {
                ContentDecision::Rejected(RejectReason::Regression)
            };
        }
        let previous = turn.visible_content().to_string();
        let Some(container) = turn.container_mut() else {
            return ContentDecision::Unchanged;
        };
        container.set_summary(text);
        let rendered = container.render();
        turn.replace_visible(rendered.clone());
        ContentDecision::Accepted { previous, current: rendered }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{Phase, TurnId};
    use serde_json::json;

    fn open_turn() -> Turn {
        Turn::new(TurnId::from("t1"))
    }

    fn commit(result: &str) -> ContentWrite {
        ContentWrite::Commit(CommitPermit::new(LockedContainer::from_result(&json!(result), None, "")))
    }

    #[test]
    fn test_open_turn_accepts_growing_text() {
        let mut turn = open_turn();
        assert!(ContentLock::apply(&mut turn, ContentWrite::Stream("H".to_string())).is_accepted());
        let decision = ContentLock::apply(&mut turn, ContentWrite::Stream("Hi".to_string()));
        assert_eq!(
            decision,
            ContentDecision::Accepted { previous: "H".to_string(), current: "Hi".to_string() }
        );
        assert_eq!(turn.visible_content(), "Hi");
    }

    #[test]
    fn test_open_turn_rejects_shrinking_text() {
        let mut turn = open_turn();
        ContentLock::apply(&mut turn, ContentWrite::Stream("Hello".to_string()));
        let decision = ContentLock::apply(&mut turn, ContentWrite::Stream("He".to_string()));
        assert_eq!(decision, ContentDecision::Rejected(RejectReason::Regression));
        assert_eq!(turn.visible_content(), "Hello");
        assert_eq!(
            ContentLock::apply(&mut turn, ContentWrite::Stream("Hello".to_string())),
            ContentDecision::Unchanged
        );
    }

    #[test]
    fn test_open_turn_takes_rewritten_text_of_same_length() {
        let mut turn = open_turn();
        ContentLock::apply(&mut turn, ContentWrite::Stream("Hello".to_string()));
        let decision = ContentLock::apply(&mut turn, ContentWrite::Stream("Help!".to_string()));
        assert_eq!(
            decision,
            ContentDecision::Accepted { previous: "Hello".to_string(), current: "Help!".to_string() }
        );
        assert_eq!(turn.visible_content(), "Help!");
        assert_eq!(
            ContentLock::apply(&mut turn, ContentWrite::Stream("Hel".to_string())),
            ContentDecision::Rejected(RejectReason::Regression)
        );
    }

    #[test]
    fn test_commit_replaces_and_locks() {
        let mut turn = open_turn();
        ContentLock::apply(&mut turn, ContentWrite::Stream("Let me look that up".to_string()));
        let decision = ContentLock::apply(&mut turn, commit("R"));
        assert!(decision.is_accepted());
        assert_eq!(turn.visible_content(), "R");
        assert_eq!(turn.lock_state(), LockState::Locked);
    }

    #[test]
    fn test_locked_turn_rejects_stream_and_second_commit() {
        let mut turn = open_turn();
        ContentLock::apply(&mut turn, commit("R"));

        let stale = ContentLock::apply(&mut turn, ContentWrite::Stream("stale narration".to_string()));
        assert_eq!(stale, ContentDecision::Rejected(RejectReason::Locked));
        let again = ContentLock::apply(&mut turn, commit("other"));
        assert_eq!(again, ContentDecision::Rejected(RejectReason::AlreadyLocked));
        let notice = ContentLock::apply(&mut turn, ContentWrite::ErrorNotice("boom".to_string()));
        assert_eq!(notice, ContentDecision::Rejected(RejectReason::Locked));
        assert_eq!(turn.visible_content(), "R");
    }

    #[test]
    fn test_summary_fills_reserved_slot_only() {
        let mut turn = open_turn();
        ContentLock::apply(&mut turn, commit("R"));
        ContentLock::apply(&mut turn, ContentWrite::Summary("foo".to_string()));
        ContentLock::apply(&mut turn, ContentWrite::Summary("foobar".to_string()));

        let container = turn.container().unwrap();
        assert_eq!(container.tool_content(), "R");
        assert_eq!(container.summary(), "foobar");
        assert_eq!(turn.summary(), Some("foobar"));
        assert_eq!(turn.visible_content(), container.render());

        let shrink = ContentLock::apply(&mut turn, ContentWrite::Summary("foo".to_string()));
        assert_eq!(shrink, ContentDecision::Rejected(RejectReason::Regression));
        let same = ContentLock::apply(&mut turn, ContentWrite::Summary("foobar".to_string()));
        assert_eq!(same, ContentDecision::Unchanged);
    }

    #[test]
    fn test_summary_while_open_is_kept_off_screen() {
        let mut turn = open_turn();
        ContentLock::apply(&mut turn, ContentWrite::Stream("text".to_string()));
        let decision = ContentLock::apply(&mut turn, ContentWrite::Summary("sum".to_string()));
        assert_eq!(decision, ContentDecision::Unchanged);
        assert_eq!(turn.visible_content(), "text");
        assert_eq!(turn.summary(), Some("sum"));
    }

    #[test]
    fn test_error_notice_appends_to_open_content() {
        let mut turn = open_turn();
        ContentLock::apply(&mut turn, ContentWrite::Stream("partial".to_string()));
        ContentLock::apply(&mut turn, ContentWrite::ErrorNotice("Error: upstream closed".to_string()));
        assert_eq!(turn.visible_content(), "partial\n\nError: upstream closed");
    }

    #[test]
    fn test_terminal_turn_rejects_everything() {
        let mut turn = open_turn();
        turn.advance_phase(Phase::Done);
        let decision = ContentLock::apply(&mut turn, ContentWrite::Stream("late".to_string()));
        assert_eq!(decision, ContentDecision::Rejected(RejectReason::Terminal));
        assert!(ContentLock::apply(&mut turn, commit("R")).is_rejected());
    }
}
