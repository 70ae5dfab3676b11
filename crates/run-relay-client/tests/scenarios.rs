//! End-to-end reconciliation scenarios over wire-format JSON.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use run_relay_agent::{
    drive_run, ActionStep, FinalAnswerStep, MessageEncoder, PlanningStep, RunContext,
    ScriptedSource, StepEvent, StepKind, StepSource,
};

use run_relay_client::{
    route, AgentStatus, ApplyKind, ClientSession, EntryState, Reconciler, StatusTracker, Surface,
    View,
};
use run_relay_core::message::{MessageType, RunMessage};
use run_relay_core::protocol::{ControlFrame, ServerFrame};

fn parse(value: Value) -> RunMessage {
    serde_json::from_value(value).unwrap()
}

fn search_stream() -> Vec<RunMessage> {
    vec![
        parse(json!({
            "message_id": "m1", "content": "Search", "session_id": "s", "step_number": 1,
            "metadata": {"message_type": "action-thought", "component": "chat", "streaming": true}
        })),
        parse(json!({
            "message_id": "m1", "content": "Searching for", "session_id": "s", "step_number": 1,
            "metadata": {"message_type": "action-thought", "component": "chat", "streaming": true, "is_delta": true}
        })),
        parse(json!({
            "message_id": "m1", "content": "Searching for capital of France", "session_id": "s", "step_number": 1,
            "metadata": {"message_type": "action-thought", "component": "chat", "streaming": true, "is_delta": true}
        })),
        parse(json!({
            "message_id": "m2", "content": "I will search for the capital of France.", "session_id": "s", "step_number": 1,
            "metadata": {"message_type": "action-thought", "component": "chat", "streaming": false, "stream_id": "m1"}
        })),
    ]
}

#[test]
fn test_streamed_thought_reconciles_to_single_entry() {
    let mut reconciler = Reconciler::new();
    let kinds: Vec<ApplyKind> = search_stream()
        .iter()
        .map(|m| reconciler.apply(m).kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ApplyKind::Created,
            ApplyKind::Updated,
            ApplyKind::Updated,
            ApplyKind::Transferred
        ]
    );

    let transcript = reconciler.transcript();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].display_id, "m1");
    assert_eq!(
        transcript[0].message.content,
        "I will search for the capital of France."
    );
    assert_eq!(transcript[0].state, EntryState::Settled);
}

async fn demo_run() -> Vec<RunMessage> {
    let source: Arc<dyn StepSource> =
        Arc::new(ScriptedSource::demo().with_delay(Duration::ZERO));
    let (tx, mut rx) = mpsc::unbounded_channel();
    drive_run(
        source,
        &MessageEncoder::default(),
        RunContext::new("s", 0),
        "What is the capital of France?".into(),
        CancellationToken::new(),
        tx,
    )
    .await;

    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn test_encoded_stream_content_grows_monotonically() {
    let messages = demo_run().await;

    let mut last: HashMap<&str, &str> = HashMap::new();
    let mut streamed = 0;
    for message in &messages {
        if let Some(previous) = last.get(message.message_id.as_str()) {
            assert!(message.content.len() >= previous.len());
            assert!(
                message.content.starts_with(previous),
                "{:?} does not extend {:?}",
                message.content,
                previous
            );
        }
        if message.is_streaming() {
            streamed += 1;
        }
        last.insert(message.message_id.as_str(), message.content.as_str());
    }
    assert!(streamed > 3);
}

#[test]
fn test_unannounced_thought_reconciles_to_one_entry() {
    let encoder = MessageEncoder::default();
    let mut ctx = RunContext::new("s", 0);
    let events = vec![
        StepEvent::Planning(PlanningStep {
            plan: "1. Search".into(),
            error: None,
        }),
        StepEvent::ModelDelta {
            text: "I will ".into(),
        },
        StepEvent::ModelDelta {
            text: "search".into(),
        },
        StepEvent::Action(ActionStep {
            thought: Some("I will search".into()),
            ..Default::default()
        }),
    ];

    let mut reconciler = Reconciler::new();
    for event in events {
        for message in encoder.encode(&mut ctx, event).unwrap() {
            reconciler.apply(&message);
        }
    }

    let thoughts: Vec<_> = reconciler
        .transcript()
        .iter()
        .filter(|e| e.message.content.contains("I will search"))
        .collect();
    assert_eq!(thoughts.len(), 1);
    assert_eq!(
        thoughts[0].message.message_type(),
        Some(MessageType::ActionThought)
    );
    assert_eq!(thoughts[0].state, EntryState::Settled);
}

#[test]
fn test_streamed_answer_reports_writing() {
    let encoder = MessageEncoder::default();
    let mut ctx = RunContext::new("s", 0);
    let mut status = StatusTracker::new();

    for event in [
        StepEvent::StepStarted {
            kind: StepKind::Answer,
        },
        StepEvent::ModelDelta {
            text: "Par".into(),
        },
    ] {
        for message in encoder.encode(&mut ctx, event).unwrap() {
            status.observe(&message);
        }
    }
    assert_eq!(status.status(), AgentStatus::Writing);

    let done = encoder
        .encode(
            &mut ctx,
            StepEvent::FinalAnswer(FinalAnswerStep {
                answer: json!("Paris"),
                error: None,
            }),
        )
        .unwrap();
    for message in &done {
        status.observe(message);
    }
    assert_eq!(status.status(), AgentStatus::Done);
}

#[test]
fn test_replay_is_idempotent() {
    let fragments = search_stream();

    let mut once = Reconciler::new();
    for m in &fragments {
        once.apply(m);
    }

    // at-least-once delivery: every fragment twice, in order
    let mut doubled = Reconciler::new();
    for m in &fragments {
        doubled.apply(m);
        doubled.apply(m);
    }

    let mut replayed = Reconciler::new();
    replayed.rebuild(&fragments);
    replayed.rebuild(&fragments);

    assert_eq!(once.transcript(), doubled.transcript());
    assert_eq!(once.transcript(), replayed.transcript());
}

#[test]
fn test_structured_final_answer_routes_to_structured_view() {
    let answer = parse(json!({
        "message_id": "fa", "content": "", "session_id": "s", "step_number": 2,
        "metadata": {
            "message_type": "final-answer", "component": "chat",
            "has_structured_data": true, "answer_title": "Capital",
            "answer_content": "Paris", "answer_sources": []
        }
    }));
    let route = route(&answer).expect("structured answer must be displayed");
    assert_eq!(route.surface, Surface::Chat);
    match route.view {
        View::Structured(structured) => {
            assert_eq!(structured.title.as_deref(), Some("Capital"));
            assert_eq!(structured.content.as_deref(), Some("Paris"));
            assert!(structured.sources.is_empty());
        }
        other => panic!("expected structured view, got {other:?}"),
    }
}

#[test]
fn test_every_non_structural_type_routes_to_one_surface() {
    let types = [
        ("user-query", Surface::Chat),
        ("planning-header", Surface::Chat),
        ("planning-content", Surface::Chat),
        ("action-thought", Surface::Chat),
        ("tool-call", Surface::Chat),
        ("code-action", Surface::Code),
        ("execution-log", Surface::Log),
        ("final-answer", Surface::Chat),
        ("step-footer", Surface::Chat),
    ];
    for (message_type, expected) in types {
        let m = parse(json!({
            "message_id": "x", "content": "body",
            "metadata": {"message_type": message_type}
        }));
        assert_eq!(
            route(&m).map(|r| r.surface),
            Some(expected),
            "{message_type}"
        );
    }

    let separator = parse(json!({"message_id": "sep", "metadata": {"message_type": "separator"}}));
    assert!(route(&separator).is_none());
}

#[test]
fn test_status_does_not_regress_on_structural_messages() {
    let mut tracker = StatusTracker::new();
    tracker.observe(&parse(json!({
        "message_id": "t", "content": "Thinking",
        "metadata": {"message_type": "action-thought", "streaming": true, "status": "thinking"}
    })));
    assert_eq!(tracker.status(), AgentStatus::Thinking);

    for structural in [
        json!({"message_id": "a", "metadata": {"message_type": "separator"}}),
        json!({"message_id": "b", "content": "Step 1", "metadata": {"message_type": "step-footer", "status": "done"}}),
        json!({"message_id": "c", "content": "ok", "metadata": {"message_type": "tool-call", "status": "done"}}),
    ] {
        let before = tracker.status();
        tracker.observe(&parse(structural));
        assert_eq!(tracker.status(), before);
    }
}

#[test]
fn test_resync_matches_live_state() {
    let fragments = search_stream();

    let mut live = ClientSession::new();
    for m in &fragments {
        live.handle_frame(ServerFrame::from(m.clone()));
    }

    // History holds one coalesced record per identity.
    let mut first = fragments[2].clone();
    first.metadata.is_delta = false;
    let history = vec![first, fragments[3].clone()];
    let mut rebuilt = ClientSession::new();
    rebuilt.begin_resync();
    rebuilt.handle_frame(ControlFrame::Messages { messages: history }.into());

    assert_eq!(live.transcript().len(), rebuilt.transcript().len());
    assert_eq!(
        live.transcript()[0].message.content,
        rebuilt.transcript()[0].message.content
    );
    assert_eq!(live.transcript()[0].display_id, rebuilt.transcript()[0].display_id);
    assert_eq!(live.status(), rebuilt.status());
}
