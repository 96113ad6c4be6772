//! Cancellation controller: one abortable handle per session, with a deadline backstop.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tessera_abstraction::AbortReason;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default session budget. Sized for slow tool execution, not network latency.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Aborted(AbortReason),
    Finished,
}

/// Cloneable handle that stops a session.
///
/// The first settlement wins: a cancel after the session finished, or after
/// an earlier cancel, is a no-op.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    settled: Arc<OnceLock<Settled>>,
}

impl CancelHandle {
    fn new() -> Self {
        Self { token: CancellationToken::new(), settled: Arc::new(OnceLock::new()) }
    }

    /// Stops the session on behalf of the user. Returns `true` if this call did it.
    pub fn cancel(&self) -> bool {
        self.cancel_with(AbortReason::UserCancelled)
    }

    /// Stops the session with `reason`. Returns `true` if this call did it.
    pub fn cancel_with(&self, reason: AbortReason) -> bool {
        if self.settled.set(Settled::Aborted(reason)).is_err() {
            return false;
        }
        info!(reason = %reason, "Cancelling stream session");
        self.token.cancel();
        true
    }

    /// Returns `true` once the session has been aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the session was aborted, if it was.
    #[must_use]
    pub fn reason(&self) -> Option<AbortReason> {
        match self.settled.get() {
            Some(Settled::Aborted(reason)) => Some(*reason),
            _ => None,
        }
    }

    /// Resolves when the session is aborted.
    pub async fn cancelled(&self) -> AbortReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(AbortReason::UserCancelled)
    }

    /// Marks the session finished so later cancels do nothing.
    pub(crate) fn close(&self) -> bool {
        self.settled.set(Settled::Finished).is_ok()
    }
}

/// Owns the deadline timer for one session.
///
/// Must be started inside a Tokio runtime. Dropping the controller disarms it.
#[derive(Debug)]
pub struct CancellationController {
    handle: CancelHandle,
    deadline: Instant,
    timer: Option<JoinHandle<()>>,
}

impl CancellationController {
    /// Arms a controller that aborts with [`AbortReason::Timeout`] after `budget`.
    pub fn start(budget: Duration) -> Self {
        let handle = CancelHandle::new();
        let deadline = Instant::now() + budget;
        let timer_handle = handle.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    if timer_handle.cancel_with(AbortReason::Timeout) {
                        warn!(budget_secs = budget.as_secs(), "Stream session exceeded its budget");
                    }
                }
                () = timer_handle.token.cancelled() => {}
            }
        });
        Self { handle, deadline, timer: Some(timer) }
    }

    /// A handle for the UI (or anything else) to cancel with.
    #[must_use]
    pub fn handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the budget expires.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Stops the deadline timer and settles the handle as finished.
    pub fn disarm(&mut self) {
        self.handle.close();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for CancellationController {
    fn drop(&mut self) {
        self.disarm();
    }
}
