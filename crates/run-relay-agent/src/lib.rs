//! Agent-side half of Run Relay.
//!
//! The agent itself is an external collaborator: it implements [`StepSource`]
//! and pushes [`StepEvent`]s. This crate turns those events into
//! [`RunMessage`](run_relay_core::message::RunMessage)s with the
//! [`MessageEncoder`] and drives a run to completion or cancellation.

use serde::{Deserialize, Serialize};

pub mod encoder;
pub mod runtime;
pub mod source;

pub use encoder::{EncodeError, EncoderSettings, MessageEncoder, Phase, RunContext};
pub use runtime::drive_run;
pub use source::{ScriptedSource, StepSender, StepSource};

/// Which kind of step is starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Planning,
    Action,
    /// The final answer is about to stream.
    Answer,
}

/// Events emitted by a step source during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    /// A step begins; model output for it may stream next.
    StepStarted { kind: StepKind },

    /// A token-level delta of in-progress model output (not cumulative).
    ModelDelta { text: String },

    /// A planning step completed.
    Planning(PlanningStep),

    /// An action step completed.
    Action(ActionStep),

    /// The run produced its answer.
    FinalAnswer(FinalAnswerStep),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningStep {
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    /// Generated code the step executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Captured output of tool or code execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswerStep {
    /// Plain text or a structured value with title/content/sources fields.
    pub answer: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed { message: String },
}

/// Summary of a driven run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Highest step number used; the session's next run continues from here.
    pub last_step: u32,
    pub messages_emitted: usize,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_event_wire_format() {
        let event: StepEvent = serde_json::from_value(json!({
            "type": "action",
            "thought": "look it up",
            "tool_calls": [{"name": "web_search", "arguments": {"query": "capital of France"}}],
            "observations": "Paris"
        }))
        .unwrap();
        match event {
            StepEvent::Action(step) => {
                assert_eq!(step.thought.as_deref(), Some("look it up"));
                assert_eq!(step.tool_calls[0].name, "web_search");
                assert!(step.code.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event: StepEvent =
            serde_json::from_value(json!({"type": "step_started", "kind": "planning"})).unwrap();
        assert_eq!(
            event,
            StepEvent::StepStarted {
                kind: StepKind::Planning
            }
        );
    }
}
