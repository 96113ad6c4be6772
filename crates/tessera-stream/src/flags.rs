//! Transient session flags shown by the UI while a turn is in flight.

use serde::Serialize;

use crate::turn::Phase;

/// Streaming, processing-tools and generating-summary indicators.
///
/// Raised and lowered by the router as phases advance. The session exit path
/// clears them through [`clear_once`](Self::clear_once), which only takes
/// effect the first time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransientFlags {
    streaming: bool,
    processing_tools: bool,
    generating_summary: bool,
    clears: u32,
}

impl TransientFlags {
    #[must_use]
    pub const fn streaming(&self) -> bool {
        self.streaming
    }

    #[must_use]
    pub const fn processing_tools(&self) -> bool {
        self.processing_tools
    }

    #[must_use]
    pub const fn generating_summary(&self) -> bool {
        self.generating_summary
    }

    /// Returns `true` if any indicator is still raised.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.streaming || self.processing_tools || self.generating_summary
    }

    /// How many times the exit path cleared the flags (0 or 1).
    #[must_use]
    pub const fn clear_count(&self) -> u32 {
        self.clears
    }

    /// Raises the indicators that belong to `phase` and lowers the ones it ends.
    pub(crate) fn follow(&mut self, phase: Phase) {
        match phase {
            Phase::Created => {}
            Phase::StreamingText => self.streaming = true,
            Phase::ToolsDetected | Phase::ExecutingTools => {
                self.streaming = true;
                self.processing_tools = true;
            }
            Phase::ToolsLocked => self.processing_tools = false,
            Phase::Summarizing => self.generating_summary = true,
            Phase::Done | Phase::Errored | Phase::Cancelled => self.lower_all(),
        }
    }

    pub(crate) fn raise_streaming(&mut self) {
        self.streaming = true;
    }

    pub(crate) fn lower_processing(&mut self) {
        self.processing_tools = false;
    }

    pub(crate) fn lower_summary(&mut self) {
        self.generating_summary = false;
    }

    /// Clears every indicator. Only the first call counts.
    pub(crate) fn clear_once(&mut self) -> bool {
        if self.clears > 0 {
            return false;
        }
        self.lower_all();
        self.clears = 1;
        true
    }

    fn lower_all(&mut self) {
        self.streaming = false;
        self.processing_tools = false;
        self.generating_summary = false;
    }
}
