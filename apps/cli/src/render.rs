//! Terminal rendering of frames, phase changes and session outcomes.
//!
//! The turn's text goes to stdout. Phase changes and progress go to stderr
//! so the text can be piped on its own.

use std::io::{self, Write};

use colored::Colorize;
use tessera_stream::{AbortReason, DisplayFrame, Phase, SessionEnd, SessionOutcome, ToolStatus, Turn};

/// Prints typewriter frames as they arrive.
///
/// Frames carry the whole revealed text; only the new suffix is written.
/// When the text is replaced instead of extended (a tool result locking the
/// content) the new text starts on a fresh line.
#[derive(Debug, Default)]
pub struct FramePrinter {
    printed: String,
    status: Option<String>,
}

impl FramePrinter {
    pub fn frame(&mut self, frame: &DisplayFrame) {
        let mut stdout = io::stdout().lock();
        let _ = match frame.text.strip_prefix(self.printed.as_str()) {
            Some(suffix) => write!(stdout, "{suffix}"),
            None => write!(stdout, "\n{}", frame.text),
        };
        let _ = stdout.flush();
        self.printed.clone_from(&frame.text);
    }

    /// Prints a status line when the turn's phase or progress changed.
    pub fn status(&mut self, turn: &Turn) {
        let line = status_line(turn);
        if self.status.as_deref() != Some(line.as_str()) {
            eprintln!("{}", format!("[{line}]").dimmed());
            self.status = Some(line);
        }
    }

    pub fn finish(&self) {
        if !self.printed.is_empty() && !self.printed.ends_with('\n') {
            println!();
        }
    }
}

/// One-line description of where a turn is.
pub fn status_line(turn: &Turn) -> String {
    let mut line = turn.phase().to_string();
    if let Some(progress) = turn.progress() {
        line.push_str(&format!(" {progress}%"));
    }
    if let Some(text) = turn.status_text() {
        line.push_str(" · ");
        line.push_str(text);
    }
    line
}

/// Plain-text summary of a finished session, one entry per line.
pub fn summary_lines(outcome: &SessionOutcome) -> Vec<String> {
    let turn = &outcome.turn;
    let mut lines = vec![format!("turn {} · {}", turn.id(), turn.phase())];

    let mut usage = Vec::new();
    if let Some(tokens) = turn.tokens_used() {
        usage.push(format!("tokens: {tokens}"));
    }
    if let Some(cost) = turn.cost() {
        usage.push(format!("cost: ${cost:.4}"));
    }
    if !usage.is_empty() {
        lines.push(usage.join(" · "));
    }

    if let Some(invocations) = turn.tool_invocations() {
        let outcomes = turn.tool_results().outcomes();
        let tools: Vec<String> = invocations
            .iter()
            .enumerate()
            .map(|(i, invocation)| {
                let status = outcomes.get(i).map_or(ToolStatus::Pending, |outcome| outcome.status);
                format!("{} ({})", invocation.name, tool_status_label(status))
            })
            .collect();
        lines.push(format!("tools: {}", tools.join(", ")));
    }

    if let Some(error) = turn.summary_error() {
        lines.push(format!("summary failed: {error}"));
    }
    if let Some(error) = turn.error() {
        lines.push(format!("error: {error}"));
    }
    if outcome.decode_errors > 0 {
        lines.push(format!("skipped {} malformed event(s)", outcome.decode_errors));
    }
    if let SessionEnd::Cancelled(reason) = outcome.end {
        lines.push(reason.label().to_string());
    }
    lines
}

const fn tool_status_label(status: ToolStatus) -> &'static str {
    match status {
        ToolStatus::Pending => "pending",
        ToolStatus::Running => "running",
        ToolStatus::Completed => "completed",
        ToolStatus::Failed => "failed",
    }
}

pub fn print_outcome(outcome: &SessionOutcome) {
    let lines = summary_lines(outcome);
    let Some((header, rest)) = lines.split_first() else {
        return;
    };
    let header = match outcome.turn.phase() {
        Phase::Done => header.green().bold(),
        Phase::Cancelled => header.yellow().bold(),
        _ => header.red().bold(),
    };
    println!("{header}");
    for line in rest {
        println!("{line}");
    }
}

/// Reports a session that was stopped before the server created a turn.
pub fn print_abort(reason: AbortReason) {
    println!("{}", reason.label().yellow().bold());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_stream::event::{ToolExecHeartbeat, ToolsDetected, TurnCreated, TurnDone};
    use tessera_stream::{EventRouter, StreamEvent, ToolInvocation, TransientFlags, TurnId};

    fn id() -> TurnId {
        TurnId::from("t1")
    }

    fn router() -> EventRouter {
        let mut router = EventRouter::new();
        router.dispatch(StreamEvent::TurnCreated(TurnCreated { turn_id: id() })).unwrap();
        router
    }

    fn outcome(turn: Turn, end: SessionEnd) -> SessionOutcome {
        SessionOutcome { turn, end, decode_errors: 0, flags: TransientFlags::default(), watchdog_fired: false }
    }

    #[test]
    fn test_status_line_includes_progress_and_text() {
        let mut router = router();
        router
            .dispatch(StreamEvent::ToolsDetected(ToolsDetected {
                turn_id: id(),
                tools: vec![ToolInvocation::new("search", serde_json::Value::Null)],
            }))
            .unwrap();
        router
            .dispatch(StreamEvent::ToolExecHeartbeat(ToolExecHeartbeat {
                turn_id: id(),
                message: "Querying".to_string(),
                progress: Some(40.0),
                tool_index: Some(0),
            }))
            .unwrap();

        assert_eq!(status_line(router.active().unwrap()), "executing tools 40% · Querying");
    }

    #[test]
    fn test_status_line_for_fresh_turn() {
        assert_eq!(status_line(router().active().unwrap()), "created");
    }

    #[test]
    fn test_summary_of_completed_turn() {
        let mut router = router();
        router
            .dispatch(StreamEvent::TurnDone(TurnDone {
                turn_id: id(),
                tokens_used: Some(12),
                cost: Some(0.001),
                full_content: "Hi".to_string(),
                updated_turn: None,
            }))
            .unwrap();

        let lines = summary_lines(&outcome(router.active().unwrap().clone(), SessionEnd::Completed));
        assert_eq!(lines, vec!["turn t1 · done".to_string(), "tokens: 12 · cost: $0.0010".to_string()]);
    }

    #[test]
    fn test_summary_reports_cancellation_and_errors() {
        let mut router = router();
        router.cancel(AbortReason::Timeout).unwrap();
        let mut outcome = outcome(router.active().unwrap().clone(), SessionEnd::Cancelled(AbortReason::Timeout));
        outcome.decode_errors = 2;

        let lines = summary_lines(&outcome);
        assert_eq!(lines[0], "turn t1 · cancelled");
        assert!(lines.contains(&"skipped 2 malformed event(s)".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("timed out"));
    }
}
