//! End-to-end sessions over a scripted transport.

use std::sync::Arc;

use serde_json::{Value, json};
use tessera_stream::{
    AbortReason, FlowOrchestrator, LockState, LockedContainer, Phase, ScriptedTransport, SessionEnd, SseRecord,
    StreamConfig, StreamOptions, ToolStatus,
};

fn record(event: &str, data: Value) -> String {
    SseRecord::new(event, data.to_string()).encode()
}

fn wire(records: &[(&str, Value)]) -> String {
    records.iter().map(|(event, data)| record(event, data.clone())).collect()
}

fn config(typewriter: bool) -> StreamConfig {
    let mut config = StreamConfig::default();
    config.typewriter.enabled = Some(typewriter);
    config
}

fn orchestrator(transport: ScriptedTransport, typewriter: bool) -> FlowOrchestrator {
    FlowOrchestrator::new(Arc::new(transport), config(typewriter))
}

fn scenario_b() -> Vec<(&'static str, Value)> {
    vec![
        ("turn-created", json!({"turnId": "t1"})),
        ("tools-detected", json!({"turnId": "t1", "tools": [{"name": "lookup", "args": {}}]})),
        (
            "tool-result-section",
            json!({"turnId": "t1", "sectionIndex": 0, "sectionTotal": 1, "sectionContent": "R", "progress": 100}),
        ),
        ("tools-committed", json!({"turnId": "t1", "finalResult": "R"})),
        ("text-delta", json!({"turnId": "t1", "content": "stale"})),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_plain_text_turn() {
    let wire = wire(&[
        ("turn-created", json!({"turnId": "t1"})),
        ("text-delta", json!({"turnId": "t1", "content": "H"})),
        ("text-delta", json!({"turnId": "t1", "content": "Hi"})),
        ("turn-done", json!({"turnId": "t1", "tokensUsed": 5, "cost": 0.002, "fullContent": "Hi"})),
    ]);
    let session = orchestrator(ScriptedTransport::from_sse(&wire, 16), true).start(
        "c1",
        "say hi",
        StreamOptions::default(),
    );
    let mut frames = session.subscribe_frames();

    let outcome = session.run().await.unwrap();

    assert_eq!(outcome.end, SessionEnd::Completed);
    assert_eq!(outcome.turn.visible_content(), "Hi");
    assert_eq!(outcome.turn.phase(), Phase::Done);
    assert_eq!(outcome.turn.tokens_used(), Some(5));
    assert_eq!(outcome.flags.clear_count(), 1);

    // The reveal may still be running; the channel closes when it ends.
    let mut shown = Vec::new();
    while let Ok(frame) = frames.recv().await {
        shown.push(frame.text);
    }
    assert_eq!(shown.last().map(String::as_str), Some("Hi"));
    for pair in shown.windows(2) {
        assert!(pair[1].starts_with(pair[0].as_str()), "frames went backward: {shown:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_scenario_b_stale_delta_after_commit() {
    let wire = wire(&scenario_b());
    let outcome = orchestrator(ScriptedTransport::from_sse(&wire, 0), false)
        .send("c1", "look it up", StreamOptions::default())
        .await
        .unwrap();

    let expected = LockedContainer::from_result(&json!("R"), None, "R");
    assert_eq!(outcome.turn.visible_content(), expected.render());
    assert_eq!(outcome.turn.lock_state(), LockState::Locked);
    assert_eq!(outcome.turn.container(), Some(&expected));
    assert_eq!(outcome.turn.tool_results().outcomes()[0].status, ToolStatus::Completed);
    // No turn-done arrived.
    assert_eq!(outcome.end, SessionEnd::EndOfInput);
}

#[tokio::test]
async fn test_scenario_c_summary_fills_reserved_slot() {
    let mut records = scenario_b();
    records.pop();
    records.extend([
        ("summary-started", json!({"turnId": "t1"})),
        ("summary-delta", json!({"content": "foo", "progress": 40})),
        ("summary-delta", json!({"content": "foobar", "progress": 90})),
        ("summary-done", json!({"fullContent": "foobar"})),
        ("turn-done", json!({"turnId": "t1", "tokensUsed": 30, "cost": 0.01, "fullContent": "stale narration"})),
    ]);
    let outcome = orchestrator(ScriptedTransport::from_sse(&wire(&records), 9), false)
        .send("c1", "summarize", StreamOptions::default())
        .await
        .unwrap();

    let turn = &outcome.turn;
    let container = turn.container().unwrap();
    assert_eq!(container.summary(), "foobar");
    assert_eq!(container.tool_content(), "R");
    assert_eq!(turn.summary(), Some("foobar"));
    assert_eq!(turn.visible_content(), container.render());
    assert!(turn.visible_content().starts_with("R"));
    assert_eq!(outcome.end, SessionEnd::Completed);
    assert!(!outcome.flags.generating_summary());
}

#[tokio::test]
async fn test_summary_error_keeps_tool_result() {
    let mut records = scenario_b();
    records.pop();
    records.extend([
        ("summary-started", json!({})),
        ("summary-delta", json!({"content": "par"})),
        ("summary-error", json!({"error": "second pass failed"})),
        ("turn-done", json!({"turnId": "t1", "tokensUsed": 8, "cost": 0.0, "fullContent": ""})),
    ]);
    let outcome = orchestrator(ScriptedTransport::from_sse(&wire(&records), 0), false)
        .send("c1", "summarize", StreamOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.end, SessionEnd::Completed);
    assert_eq!(outcome.turn.summary_error(), Some("second pass failed"));
    assert!(outcome.turn.visible_content().starts_with("R"));
    assert_eq!(outcome.turn.container().unwrap().tool_content(), "R");
}

#[tokio::test]
async fn test_tool_failure_does_not_abort_turn() {
    let wire = wire(&[
        ("turn-created", json!({"turnId": "t1"})),
        (
            "tools-detected",
            json!({"turnId": "t1", "tools": [{"name": "query", "args": {}}, {"name": "chart", "args": {}}]}),
        ),
        ("tool-exec-heartbeat", json!({"turnId": "t1", "message": "querying", "progress": 30, "toolIndex": 0})),
        ("tool-exec-error", json!({"turnId": "t1", "error": "no numeric columns", "toolIndex": 1, "toolName": "chart"})),
        ("tools-committed", json!({"turnId": "t1", "finalResult": {"rows": 3}, "formattedResult": "3 rows"})),
        ("turn-done", json!({"turnId": "t1", "tokensUsed": 10, "cost": 0.0, "fullContent": ""})),
    ]);
    let outcome = orchestrator(ScriptedTransport::from_sse(&wire, 0), false)
        .send("c1", "chart it", StreamOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.end, SessionEnd::Completed);
    let outcomes = outcome.turn.tool_results().outcomes();
    assert_eq!(outcomes[0].status, ToolStatus::Completed);
    assert_eq!(outcomes[1].status, ToolStatus::Failed);
    assert_eq!(outcomes[1].status_text.as_deref(), Some("no numeric columns"));
    assert_eq!(outcome.turn.visible_content(), "3 rows");
}

#[tokio::test]
async fn test_decode_error_does_not_block_next_record() {
    let mut wire = record("turn-created", json!({"turnId": "t1"}));
    wire.push_str("event: text-delta\ndata: {\"turnId\": \"t1\", \"content\": \n\n");
    wire.push_str(&record("text-delta", json!({"turnId": "t1", "content": "Hi"})));
    wire.push_str(&record("turn-done", json!({"turnId": "t1", "tokensUsed": 1, "cost": 0.0, "fullContent": "Hi"})));

    let outcome = orchestrator(ScriptedTransport::from_sse(&wire, 5), false)
        .send("c1", "hello", StreamOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.decode_errors, 1);
    assert_eq!(outcome.end, SessionEnd::Completed);
    assert_eq!(outcome.turn.visible_content(), "Hi");
}

#[tokio::test]
async fn test_turn_error_event_ends_session() {
    let wire = wire(&[
        ("turn-created", json!({"turnId": "t1"})),
        ("text-delta", json!({"turnId": "t1", "content": "Working on"})),
        ("turn-error", json!({"error": "model unavailable"})),
        ("text-delta", json!({"turnId": "t1", "content": "Working on it"})),
    ]);
    let outcome = orchestrator(ScriptedTransport::from_sse(&wire, 0), false)
        .send("c1", "hello", StreamOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.end, SessionEnd::Errored("model unavailable".to_string()));
    assert_eq!(outcome.turn.visible_content(), "Working on\n\nError: model unavailable");
    assert!(!outcome.flags.any());
}

#[tokio::test]
async fn test_cancel_mid_turn_clears_flags_once() {
    let wire = wire(&[
        ("turn-created", json!({"turnId": "t1"})),
        ("tools-detected", json!({"turnId": "t1", "tools": [{"name": "lookup", "args": {}}]})),
        ("text-delta", json!({"turnId": "t1", "content": "Hi"})),
    ]);
    let session = orchestrator(ScriptedTransport::from_sse(&wire, 0).held_open(), false).start(
        "c1",
        "hello",
        StreamOptions::default(),
    );
    let handle = session.cancel_handle();
    let canceller = handle.clone();
    let mut turns = session.subscribe_turns();

    let (outcome, ()) = tokio::join!(session.run(), async move {
        while let Ok(turn) = turns.recv().await {
            if turn.visible_content() == "Hi" {
                break;
            }
        }
        assert!(canceller.cancel());
    });
    let outcome = outcome.unwrap();

    assert_eq!(outcome.end, SessionEnd::Cancelled(AbortReason::UserCancelled));
    assert_eq!(outcome.turn.phase(), Phase::Cancelled);
    assert_eq!(outcome.turn.status_text(), Some("stopped"));
    assert_eq!(outcome.turn.visible_content(), "Hi");
    assert_eq!(outcome.flags.clear_count(), 1);
    assert!(!outcome.flags.any());
    assert!(!handle.cancel());
}

#[tokio::test(start_paused = true)]
async fn test_budget_expiry_times_out_session() {
    let wire = wire(&[
        ("turn-created", json!({"turnId": "t1"})),
        ("tool-exec-heartbeat", json!({"turnId": "t1", "message": "still running"})),
    ]);
    let mut config = config(false);
    config.timeout_secs = Some(5);
    let outcome = FlowOrchestrator::new(Arc::new(ScriptedTransport::from_sse(&wire, 0).held_open()), config)
        .send("c1", "slow tools", StreamOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.end, SessionEnd::Cancelled(AbortReason::Timeout));
    assert_eq!(outcome.turn.phase(), Phase::Cancelled);
    assert_eq!(outcome.turn.status_text(), Some("timed out"));
    assert_eq!(outcome.flags.clear_count(), 1);
}

#[tokio::test]
async fn test_snapshots_are_published_per_event() {
    let wire = wire(&[
        ("turn-created", json!({"turnId": "t1"})),
        ("text-delta", json!({"turnId": "t1", "content": "H"})),
        ("text-delta", json!({"turnId": "t1", "content": "Hi"})),
        ("turn-done", json!({"turnId": "t1", "tokensUsed": 2, "cost": 0.0, "fullContent": "Hi"})),
    ]);
    let session = orchestrator(ScriptedTransport::from_sse(&wire, 0), false).start(
        "c1",
        "hello",
        StreamOptions::default(),
    );
    let mut turns = session.subscribe_turns();
    session.run().await.unwrap();

    let mut phases = Vec::new();
    while let Ok(turn) = turns.try_recv() {
        phases.push(turn.phase());
    }
    assert_eq!(phases, vec![Phase::Created, Phase::StreamingText, Phase::StreamingText, Phase::Done]);
}

#[tokio::test(start_paused = true)]
async fn test_request_carries_options() {
    let transport = ScriptedTransport::from_sse(&record("turn-created", json!({"turnId": "t1"})), 0);
    let options = StreamOptions {
        model_id: "analyst".to_string(),
        temperature: 0.1,
        max_tokens: 512,
        system_prompt: Some("Be brief.".to_string()),
        attachments: vec![tessera_stream::Attachment::from_bytes("data.csv", "text/csv", b"a,b\n1,2\n")],
    };
    orchestrator(transport.clone(), false).send("conv-9", "chart it", options).await.unwrap();

    let request = &transport.requests()[0];
    assert_eq!(request.conversation_id, "conv-9");
    assert_eq!(request.model_id, "analyst");
    assert_eq!(request.max_tokens, 512);
    assert_eq!(request.system_prompt.as_deref(), Some("Be brief."));
    assert_eq!(request.attachments.len(), 1);
}
