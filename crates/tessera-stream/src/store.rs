//! Message state store.
//!
//! The authoritative table of in-flight Turns, keyed by id. The store is
//! owned by the event router, which makes it single-writer by construction;
//! readers get committed snapshots through [`MessageStore::subscribe`].

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::lock::{ContentDecision, ContentLock, ContentWrite};
use crate::turn::{Phase, ToolInvocation, ToolOutcomeUpdate, Turn, TurnId};

/// Capacity of the snapshot broadcast channel.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 256;

/// One indexed fragment of the tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSection {
    /// Position of the fragment.
    pub index: u32,
    /// Number of fragments announced.
    pub total: u32,
    /// Fragment text.
    pub content: String,
}

/// A partial update to one Turn. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnPatch {
    content: Option<ContentWrite>,
    thinking: Option<String>,
    phase: Option<Phase>,
    progress: Option<u8>,
    status_text: Option<String>,
    tool_invocations: Option<Vec<ToolInvocation>>,
    tool_section: Option<ToolSection>,
    tool_outcome: Option<ToolOutcomeUpdate>,
    commit_result: Option<(Value, Option<String>)>,
    tokens_used: Option<u64>,
    cost: Option<f64>,
    error: Option<String>,
    summary_error: Option<String>,
}

impl TurnPatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a visible-content write, subject to the content lock.
    #[must_use]
    pub fn content(mut self, write: ContentWrite) -> Self {
        self.content = Some(write);
        self
    }

    /// Sets cumulative thinking text.
    #[must_use]
    pub fn thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    /// Advances the phase.
    #[must_use]
    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Records progress within the (possibly new) phase.
    #[must_use]
    pub fn progress(mut self, progress: Option<u8>) -> Self {
        self.progress = progress;
        self
    }

    /// Sets the inline status line.
    #[must_use]
    pub fn status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = Some(text.into());
        self
    }

    /// Sets the tool invocations (only the first set sticks).
    #[must_use]
    pub fn tool_invocations(mut self, invocations: Vec<ToolInvocation>) -> Self {
        self.tool_invocations = Some(invocations);
        self
    }

    /// Adds an indexed tool-result fragment.
    #[must_use]
    pub fn tool_section(mut self, section: ToolSection) -> Self {
        self.tool_section = Some(section);
        self
    }

    /// Updates one invocation's outcome.
    #[must_use]
    pub fn tool_outcome(mut self, update: ToolOutcomeUpdate) -> Self {
        self.tool_outcome = Some(update);
        self
    }

    /// Records the committed tool result.
    #[must_use]
    pub fn commit_result(mut self, final_result: Value, formatted: Option<String>) -> Self {
        self.commit_result = Some((final_result, formatted));
        self
    }

    /// Reconciles token and cost accounting.
    #[must_use]
    pub fn usage(mut self, tokens_used: Option<u64>, cost: Option<f64>) -> Self {
        self.tokens_used = tokens_used;
        self.cost = cost;
        self
    }

    /// Records the terminal error message.
    #[must_use]
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Records a summary failure.
    #[must_use]
    pub fn summary_error(mut self, error: impl Into<String>) -> Self {
        self.summary_error = Some(error.into());
        self
    }
}

/// What an upsert changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// The turn did not exist before this upsert.
    pub created: bool,
    /// Decision on the content write, if the patch carried one.
    pub content: Option<ContentDecision>,
    /// The phase moved.
    pub phase_changed: bool,
    /// The tool invocations were set by this patch.
    pub invocations_set: bool,
}

/// Authoritative table of Turns by id.
#[derive(Debug)]
pub struct MessageStore {
    turns: HashMap<TurnId, Turn>,
    order: Vec<TurnId>,
    updates: broadcast::Sender<Turn>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self { turns: HashMap::new(), order: Vec::new(), updates }
    }

    /// Subscribes to committed Turn snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Turn> {
        self.updates.subscribe()
    }

    /// Returns the Turn with `turn_id`.
    #[must_use]
    pub fn get(&self, turn_id: &TurnId) -> Option<&Turn> {
        self.turns.get(turn_id)
    }

    /// Returns `true` if the store tracks `turn_id`.
    #[must_use]
    pub fn contains(&self, turn_id: &TurnId) -> bool {
        self.turns.contains_key(turn_id)
    }

    /// Turns in creation order.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.order.iter().filter_map(|id| self.turns.get(id))
    }

    /// Number of tracked Turns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Returns `true` if no Turn is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Applies `patch` to the Turn with `turn_id`, creating it if absent.
    ///
    /// Visible-content writes are routed through [`ContentLock`]. After the
    /// patch is applied, one snapshot is published to subscribers.
    pub fn upsert(&mut self, turn_id: &TurnId, patch: TurnPatch) -> PatchOutcome {
        let created = !self.turns.contains_key(turn_id);
        if created {
            self.order.push(turn_id.clone());
        }
        let turn = self.turns.entry(turn_id.clone()).or_insert_with(|| Turn::new(turn_id.clone()));

        let mut invocations_set = false;
        if let Some(invocations) = patch.tool_invocations {
            invocations_set = turn.set_tool_invocations(invocations);
            if !invocations_set {
                warn!(turn_id = %turn_id, "Tool invocations already set; ignoring update");
            }
        }
        if let Some(update) = patch.tool_outcome {
            let index = update.index;
            if !turn.tool_results_mut().update_outcome(update) {
                debug!(turn_id = %turn_id, index, "No tool invocation at index");
            }
        }
        if let Some(section) = patch.tool_section {
            turn.tool_results_mut().insert_section(section.index, section.total, section.content);
        }
        if let Some((final_result, formatted)) = patch.commit_result {
            turn.tool_results_mut().commit(final_result, formatted);
        }
        if let Some(thinking) = patch.thinking {
            turn.set_thinking(thinking);
        }
        let content = patch.content.map(|write| ContentLock::apply(turn, write));
        if let Some(text) = patch.status_text {
            turn.set_status_text(text);
        }
        turn.set_usage(patch.tokens_used, patch.cost);
        if let Some(error) = patch.error {
            turn.set_error(error);
        }
        if let Some(error) = patch.summary_error {
            turn.set_summary_error(error);
        }
        let phase_changed = patch.phase.is_some_and(|phase| turn.advance_phase(phase));
        if let Some(progress) = patch.progress {
            turn.set_progress(progress);
        }

        // No receivers is fine; the UI may not be listening yet.
        let _ = self.updates.send(turn.clone());

        PatchOutcome { created, content, phase_changed, invocations_set }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{CommitPermit, RejectReason};
    use crate::turn::{LockState, LockedContainer, ToolStatus};
    use serde_json::json;

    #[test]
    fn test_upsert_creates_then_updates() {
        let mut store = MessageStore::new();
        let id = TurnId::from("t1");
        let outcome = store.upsert(&id, TurnPatch::new());
        assert!(outcome.created);
        assert_eq!(store.len(), 1);

        let outcome = store.upsert(
            &id,
            TurnPatch::new()
                .content(ContentWrite::Stream("Hi".to_string()))
                .phase(Phase::StreamingText),
        );
        assert!(!outcome.created);
        assert!(outcome.phase_changed);
        assert!(outcome.content.unwrap().is_accepted());
        assert_eq!(store.get(&id).unwrap().visible_content(), "Hi");
    }

    #[test]
    fn test_upsert_routes_content_through_lock() {
        let mut store = MessageStore::new();
        let id = TurnId::from("t1");
        let container = LockedContainer::from_result(&json!("R"), None, "");
        store.upsert(&id, TurnPatch::new().content(ContentWrite::Commit(CommitPermit::new(container))));

        let outcome = store.upsert(&id, TurnPatch::new().content(ContentWrite::Stream("stale".to_string())));
        assert_eq!(outcome.content, Some(ContentDecision::Rejected(RejectReason::Locked)));
        let turn = store.get(&id).unwrap();
        assert_eq!(turn.lock_state(), LockState::Locked);
        assert_eq!(turn.visible_content(), "R");
    }

    #[test]
    fn test_phase_then_progress_in_one_patch() {
        let mut store = MessageStore::new();
        let id = TurnId::from("t1");
        store.upsert(&id, TurnPatch::new().phase(Phase::ExecutingTools).progress(Some(80)));
        store.upsert(&id, TurnPatch::new().phase(Phase::ToolsLocked).progress(Some(5)));
        assert_eq!(store.get(&id).unwrap().progress(), Some(5));
    }

    #[test]
    fn test_tool_outcome_and_commit() {
        let mut store = MessageStore::new();
        let id = TurnId::from("t1");
        store.upsert(
            &id,
            TurnPatch::new().tool_invocations(vec![
                ToolInvocation::new("query", json!({})),
                ToolInvocation::new("chart", json!({})),
            ]),
        );
        store.upsert(
            &id,
            TurnPatch::new().tool_outcome(ToolOutcomeUpdate {
                index: 1,
                status: ToolStatus::Failed,
                status_text: Some("renderer crashed".to_string()),
                progress: None,
            }),
        );
        store.upsert(&id, TurnPatch::new().commit_result(json!("rows"), None));

        let outcomes = store.get(&id).unwrap().tool_results().outcomes().to_vec();
        assert_eq!(outcomes[0].status, ToolStatus::Completed);
        assert_eq!(outcomes[1].status, ToolStatus::Failed);
        assert_eq!(outcomes[1].status_text.as_deref(), Some("renderer crashed"));
    }

    #[test]
    fn test_second_invocation_set_is_ignored() {
        let mut store = MessageStore::new();
        let id = TurnId::from("t1");
        let first = store.upsert(&id, TurnPatch::new().tool_invocations(vec![ToolInvocation::new("a", json!(1))]));
        let second = store.upsert(&id, TurnPatch::new().tool_invocations(vec![ToolInvocation::new("b", json!(2))]));
        assert!(first.invocations_set);
        assert!(!second.invocations_set);
        assert_eq!(store.get(&id).unwrap().tool_invocations().unwrap()[0].name, "a");
    }

    #[test]
    fn test_turns_are_isolated() {
        let mut store = MessageStore::new();
        let a = TurnId::from("a");
        let b = TurnId::from("b");
        store.upsert(&a, TurnPatch::new().content(ContentWrite::Stream("alpha".to_string())));
        store.upsert(&b, TurnPatch::new().content(ContentWrite::Stream("beta".to_string())));
        store.upsert(&b, TurnPatch::new().phase(Phase::Cancelled));

        assert_eq!(store.get(&a).unwrap().visible_content(), "alpha");
        assert_eq!(store.get(&a).unwrap().phase(), Phase::Created);
        assert_eq!(store.get(&b).unwrap().phase(), Phase::Cancelled);
        let order: Vec<_> = store.turns().map(|t| t.id().as_str().to_string()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_subscribers_see_committed_snapshots() {
        let mut store = MessageStore::new();
        let mut rx = store.subscribe();
        let id = TurnId::from("t1");
        store.upsert(&id, TurnPatch::new().content(ContentWrite::Stream("H".to_string())));
        store.upsert(&id, TurnPatch::new().content(ContentWrite::Stream("Hi".to_string())));

        assert_eq!(rx.recv().await.unwrap().visible_content(), "H");
        assert_eq!(rx.recv().await.unwrap().visible_content(), "Hi");
    }
}
