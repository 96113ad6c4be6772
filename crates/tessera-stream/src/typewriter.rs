//! Typewriter scheduler.
//!
//! Reveals growth of a Turn's visible content one character at a time with a
//! jittered delay. Each Turn owns at most one animation task; starting a new
//! one aborts the old one and picks up from whatever was already revealed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::turn::TurnId;

const FRAME_CHANNEL_CAPACITY: usize = 1024;

/// Reveal timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypewriterConfig {
    /// When `false`, every change snaps straight to its target.
    pub enabled: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TypewriterConfig {
    fn default() -> Self {
        Self { enabled: true, min_delay: Duration::from_millis(10), max_delay: Duration::from_millis(40) }
    }
}

/// Text shown for one Turn at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub turn_id: TurnId,
    pub text: String,
}

/// What [`Typewriter::animate`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Animation {
    /// A reveal task is running toward the target.
    Animating,
    /// The revealed text jumped straight to the target.
    Snapped,
    /// The target was already revealed.
    Unchanged,
}

/// Per-Turn reveal scheduler.
#[derive(Debug)]
pub struct Typewriter {
    config: TypewriterConfig,
    revealed: HashMap<TurnId, Arc<watch::Sender<String>>>,
    tasks: HashMap<TurnId, JoinHandle<()>>,
    frames: broadcast::Sender<DisplayFrame>,
}

impl Typewriter {
    pub fn new(config: TypewriterConfig) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self { config, revealed: HashMap::new(), tasks: HashMap::new(), frames }
    }

    #[must_use]
    pub const fn config(&self) -> &TypewriterConfig {
        &self.config
    }

    /// Subscribes to display frames for every Turn.
    pub fn subscribe(&self) -> broadcast::Receiver<DisplayFrame> {
        self.frames.subscribe()
    }

    /// Watches the revealed text of `turn_id`.
    pub fn revealed(&self, turn_id: &TurnId) -> Option<watch::Receiver<String>> {
        self.revealed.get(turn_id).map(|sender| sender.subscribe())
    }

    /// Currently revealed text of `turn_id`.
    #[must_use]
    pub fn revealed_text(&self, turn_id: &TurnId) -> Option<String> {
        self.revealed.get(turn_id).map(|sender| sender.borrow().clone())
    }

    /// Returns `true` while a reveal task for `turn_id` is still running.
    #[must_use]
    pub fn is_animating(&self, turn_id: &TurnId) -> bool {
        self.tasks.get(turn_id).is_some_and(|task| !task.is_finished())
    }

    /// Animates the visible text of `turn_id` from `from` toward `to`.
    ///
    /// `from` seeds the revealed text the first time a Turn is seen. Any
    /// running animation for the same Turn is aborted first. If `to` does not
    /// extend what is already revealed, the text snaps to `to`.
    pub fn animate(&mut self, turn_id: &TurnId, from: &str, to: &str) -> Animation {
        self.abort(turn_id);
        let sender = Arc::clone(
            self.revealed
                .entry(turn_id.clone())
                .or_insert_with(|| Arc::new(watch::channel(from.to_string()).0)),
        );
        let current = sender.borrow().clone();
        if current == to {
            return Animation::Unchanged;
        }
        if !self.config.enabled || !to.starts_with(current.as_str()) {
            self.publish(turn_id, &sender, to.to_string());
            return Animation::Snapped;
        }

        let remaining: Vec<char> = to[current.len()..].chars().collect();
        // Delays are drawn up front; the thread-local rng cannot cross an await.
        let delays: Vec<Duration> = remaining.iter().map(|_| self.jitter()).collect();
        debug!(turn_id = %turn_id, chars = remaining.len(), "Scheduling reveal");

        let frames = self.frames.clone();
        let id = turn_id.clone();
        let task = tokio::spawn(async move {
            let mut shown = current;
            for (ch, delay) in remaining.into_iter().zip(delays) {
                tokio::time::sleep(delay).await;
                shown.push(ch);
                sender.send_replace(shown.clone());
                let _ = frames.send(DisplayFrame { turn_id: id.clone(), text: shown.clone() });
            }
        });
        self.tasks.insert(turn_id.clone(), task);
        Animation::Animating
    }

    /// Stops any animation for `turn_id` and shows `text` immediately.
    pub fn snap(&mut self, turn_id: &TurnId, text: &str) {
        self.abort(turn_id);
        let sender = Arc::clone(
            self.revealed
                .entry(turn_id.clone())
                .or_insert_with(|| Arc::new(watch::channel(String::new()).0)),
        );
        if *sender.borrow() != text {
            self.publish(turn_id, &sender, text.to_string());
        }
    }

    /// Waits for the running animation of `turn_id`, if any, to finish.
    pub async fn settle(&mut self, turn_id: &TurnId) {
        if let Some(task) = self.tasks.remove(turn_id) {
            // An aborted task is as settled as a finished one.
            let _ = task.await;
        }
    }

    /// Detaches the running reveal of `turn_id` so it finishes on its own.
    ///
    /// The task keeps its own handle on the frame channel and is not aborted
    /// when the typewriter drops. Returns `false` if nothing was running.
    pub fn release(&mut self, turn_id: &TurnId) -> bool {
        self.tasks.remove(turn_id).is_some_and(|task| !task.is_finished())
    }

    /// Aborts every running animation, leaving revealed text where it is.
    pub fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }

    fn abort(&mut self, turn_id: &TurnId) {
        if let Some(task) = self.tasks.remove(turn_id) {
            task.abort();
        }
    }

    fn publish(&self, turn_id: &TurnId, sender: &watch::Sender<String>, text: String) {
        sender.send_replace(text.clone());
        let _ = self.frames.send(DisplayFrame { turn_id: turn_id.clone(), text });
    }

    fn jitter(&self) -> Duration {
        let (min, max) = (self.config.min_delay, self.config.max_delay);
        if max <= min {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl Default for Typewriter {
    fn default() -> Self {
        Self::new(TypewriterConfig::default())
    }
}

impl Drop for Typewriter {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
