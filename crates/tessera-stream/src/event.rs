//! Typed events carried by the turn stream.
//!
//! Every wire event type maps to exactly one [`StreamEvent`] variant, so
//! adding an event type is a compile-time change to the router's match.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_abstraction::DecodeError;

use crate::codec::SseRecord;
use crate::turn::{ToolInvocation, TurnId};

/// `turn-created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCreated {
    pub turn_id: TurnId,
}

/// `text-delta`; `content` is the cumulative text so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDelta {
    pub turn_id: TurnId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// `thinking-delta`; cumulative side-channel text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingDelta {
    pub turn_id: TurnId,
    pub content: String,
}

/// `tools-detected`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsDetected {
    pub turn_id: TurnId,
    pub tools: Vec<ToolInvocation>,
}

/// `tool-exec-heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecHeartbeat {
    pub turn_id: TurnId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_index: Option<usize>,
}

/// `tool-exec-error`; one invocation failed, the turn continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecError {
    pub turn_id: TurnId,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// `tool-result-section`; fragments are assembled by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultSection {
    pub turn_id: TurnId,
    pub section_index: u32,
    pub section_total: u32,
    pub section_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

/// `tools-committed`; the single wholesale replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCommitted {
    pub turn_id: TurnId,
    #[serde(default)]
    pub final_result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_result: Option<String>,
}

/// `summary-started`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStarted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
}

/// `summary-delta`; `content` is the cumulative summary so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

/// `summary-done`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryDone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    pub full_content: String,
}

/// `summary-error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    pub error: String,
}

/// Server-authoritative accounting attached to `turn-done`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// `turn-done`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnDone {
    pub turn_id: TurnId,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub full_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_turn: Option<TurnSnapshot>,
}

/// `turn-error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    pub error: String,
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TurnCreated(TurnCreated),
    TextDelta(TextDelta),
    ThinkingDelta(ThinkingDelta),
    ToolsDetected(ToolsDetected),
    ToolExecHeartbeat(ToolExecHeartbeat),
    ToolExecError(ToolExecError),
    ToolResultSection(ToolResultSection),
    ToolsCommitted(ToolsCommitted),
    SummaryStarted(SummaryStarted),
    SummaryDelta(SummaryDelta),
    SummaryDone(SummaryDone),
    SummaryError(SummaryError),
    TurnDone(TurnDone),
    TurnError(TurnError),
    /// An event type this client does not know; dropped by the router.
    Unknown(String),
}

fn parse<T: for<'de> Deserialize<'de>>(record: &SseRecord) -> Result<T, DecodeError> {
    serde_json::from_str(&record.data).map_err(|e| DecodeError::InvalidPayload {
        event: record.event.clone(),
        message: e.to_string(),
    })
}

impl StreamEvent {
    /// Decodes a record into a typed event.
    ///
    /// Unknown event types are not an error; they decode to [`StreamEvent::Unknown`].
    pub fn from_record(record: &SseRecord) -> Result<Self, DecodeError> {
        let event = match record.event.as_str() {
            "turn-created" => Self::TurnCreated(parse(record)?),
            "text-delta" => Self::TextDelta(parse(record)?),
            "thinking-delta" => Self::ThinkingDelta(parse(record)?),
            "tools-detected" => Self::ToolsDetected(parse(record)?),
            "tool-exec-heartbeat" => Self::ToolExecHeartbeat(parse(record)?),
            "tool-exec-error" => Self::ToolExecError(parse(record)?),
            "tool-result-section" => Self::ToolResultSection(parse(record)?),
            "tools-committed" => Self::ToolsCommitted(parse(record)?),
            "summary-started" => Self::SummaryStarted(parse(record)?),
            "summary-delta" => Self::SummaryDelta(parse(record)?),
            "summary-done" => Self::SummaryDone(parse(record)?),
            "summary-error" => Self::SummaryError(parse(record)?),
            "turn-done" => Self::TurnDone(parse(record)?),
            "turn-error" => Self::TurnError(parse(record)?),
            other => Self::Unknown(other.to_string()),
        };
        Ok(event)
    }

    /// Wire name of the event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::TurnCreated(_) => "turn-created",
            Self::TextDelta(_) => "text-delta",
            Self::ThinkingDelta(_) => "thinking-delta",
            Self::ToolsDetected(_) => "tools-detected",
            Self::ToolExecHeartbeat(_) => "tool-exec-heartbeat",
            Self::ToolExecError(_) => "tool-exec-error",
            Self::ToolResultSection(_) => "tool-result-section",
            Self::ToolsCommitted(_) => "tools-committed",
            Self::SummaryStarted(_) => "summary-started",
            Self::SummaryDelta(_) => "summary-delta",
            Self::SummaryDone(_) => "summary-done",
            Self::SummaryError(_) => "summary-error",
            Self::TurnDone(_) => "turn-done",
            Self::TurnError(_) => "turn-error",
            Self::Unknown(name) => name,
        }
    }

    /// The turn id carried by the event, if any.
    #[must_use]
    pub const fn turn_id(&self) -> Option<&TurnId> {
        match self {
            Self::TurnCreated(e) => Some(&e.turn_id),
            Self::TextDelta(e) => Some(&e.turn_id),
            Self::ThinkingDelta(e) => Some(&e.turn_id),
            Self::ToolsDetected(e) => Some(&e.turn_id),
            Self::ToolExecHeartbeat(e) => Some(&e.turn_id),
            Self::ToolExecError(e) => Some(&e.turn_id),
            Self::ToolResultSection(e) => Some(&e.turn_id),
            Self::ToolsCommitted(e) => Some(&e.turn_id),
            Self::TurnDone(e) => Some(&e.turn_id),
            Self::SummaryStarted(e) => e.turn_id.as_ref(),
            Self::SummaryDelta(e) => e.turn_id.as_ref(),
            Self::SummaryDone(e) => e.turn_id.as_ref(),
            Self::SummaryError(e) => e.turn_id.as_ref(),
            Self::TurnError(e) => e.turn_id.as_ref(),
            Self::Unknown(_) => None,
        }
    }

    /// Encodes the event as a wire record.
    pub fn to_record(&self) -> Result<SseRecord, serde_json::Error> {
        let data = match self {
            Self::TurnCreated(e) => serde_json::to_string(e)?,
            Self::TextDelta(e) => serde_json::to_string(e)?,
            Self::ThinkingDelta(e) => serde_json::to_string(e)?,
            Self::ToolsDetected(e) => serde_json::to_string(e)?,
            Self::ToolExecHeartbeat(e) => serde_json::to_string(e)?,
            Self::ToolExecError(e) => serde_json::to_string(e)?,
            Self::ToolResultSection(e) => serde_json::to_string(e)?,
            Self::ToolsCommitted(e) => serde_json::to_string(e)?,
            Self::SummaryStarted(e) => serde_json::to_string(e)?,
            Self::SummaryDelta(e) => serde_json::to_string(e)?,
            Self::SummaryDone(e) => serde_json::to_string(e)?,
            Self::SummaryError(e) => serde_json::to_string(e)?,
            Self::TurnDone(e) => serde_json::to_string(e)?,
            Self::TurnError(e) => serde_json::to_string(e)?,
            Self::Unknown(_) => "{}".to_string(),
        };
        Ok(SseRecord::new(self.event_type(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(event: &str, data: &str) -> SseRecord {
        SseRecord::new(event, data)
    }

    #[test]
    fn test_decode_text_delta() {
        let event = StreamEvent::from_record(&record(
            "text-delta",
            r#"{"turnId":"t1","content":"Hi","thinkingContent":"hmm","tokensUsed":3}"#,
        ))
        .unwrap();
        let StreamEvent::TextDelta(delta) = event else {
            panic!("expected text-delta");
        };
        assert_eq!(delta.turn_id.as_str(), "t1");
        assert_eq!(delta.content, "Hi");
        assert_eq!(delta.thinking_content.as_deref(), Some("hmm"));
        assert_eq!(delta.tokens_used, Some(3));
    }

    #[test]
    fn test_decode_tools_detected_accepts_args() {
        let event = StreamEvent::from_record(&record(
            "tools-detected",
            r#"{"turnId":"t1","tools":[{"name":"lookup","args":{"table":"sales"}}]}"#,
        ))
        .unwrap();
        let StreamEvent::ToolsDetected(detected) = event else {
            panic!("expected tools-detected");
        };
        assert_eq!(detected.tools[0].name, "lookup");
        assert_eq!(detected.tools[0].arguments, json!({"table": "sales"}));
    }

    #[test]
    fn test_decode_summary_without_turn_id() {
        let event =
            StreamEvent::from_record(&record("summary-delta", r#"{"content":"foo","progress":50}"#))
                .unwrap();
        assert_eq!(event.turn_id(), None);
        assert_eq!(event.event_type(), "summary-delta");
    }

    #[test]
    fn test_decode_turn_done_with_snapshot() {
        let event = StreamEvent::from_record(&record(
            "turn-done",
            r#"{"turnId":"t1","tokensUsed":10,"cost":0.5,"fullContent":"Hi","updatedTurn":{"tokensUsed":12,"cost":0.75,"role":"assistant"}}"#,
        ))
        .unwrap();
        let StreamEvent::TurnDone(done) = event else {
            panic!("expected turn-done");
        };
        let snapshot = done.updated_turn.unwrap();
        assert_eq!(snapshot.tokens_used, Some(12));
        assert_eq!(snapshot.cost, Some(0.75));
    }

    #[test]
    fn test_unknown_event_is_not_an_error() {
        let event = StreamEvent::from_record(&record("presence-ping", "{}")).unwrap();
        assert_eq!(event, StreamEvent::Unknown("presence-ping".to_string()));
        assert_eq!(event.turn_id(), None);
    }

    #[test]
    fn test_bad_payload_is_scoped_decode_error() {
        let err = StreamEvent::from_record(&record("text-delta", "not json")).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { ref event, .. } if event == "text-delta"));

        let missing_field =
            StreamEvent::from_record(&record("turn-created", r#"{"id":"t1"}"#)).unwrap_err();
        assert!(matches!(missing_field, DecodeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_to_record_uses_wire_names() {
        let event = StreamEvent::ToolResultSection(ToolResultSection {
            turn_id: TurnId::from("t1"),
            section_index: 0,
            section_total: 1,
            section_content: "R".to_string(),
            progress: Some(100.0),
        });
        let record = event.to_record().unwrap();
        assert_eq!(record.event, "tool-result-section");
        let value: Value = serde_json::from_str(&record.data).unwrap();
        assert_eq!(value["sectionIndex"], 0);
        assert_eq!(value["sectionContent"], "R");
        assert_eq!(StreamEvent::from_record(&record).unwrap(), event);
    }
}
