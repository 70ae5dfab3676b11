//! Step sources: the agent side of a run.
//!
//! A [`StepSource`] is whatever actually plans, calls tools, and executes code.
//! Run Relay only sees the events it pushes. [`ScriptedSource`] replays a fixed
//! script and is used by the demo server and tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{StepEvent, StepKind};

pub type StepSender = mpsc::UnboundedSender<StepEvent>;

/// Producer of step events for one run.
#[async_trait]
pub trait StepSource: Send + Sync {
    /// Source name for logs (e.g., "scripted").
    fn name(&self) -> &str;

    /// Execute a run for `query`, pushing events into `events`.
    ///
    /// Cancellation is cooperative: implementations should stop emitting once
    /// `cancel` fires. Returning `Err` marks the run as failed.
    async fn run(
        &self,
        query: String,
        events: StepSender,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Replays a fixed list of step events.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    events: Vec<StepEvent>,
    delay: Duration,
    simulate_streaming: bool,
}

impl ScriptedSource {
    pub fn new(events: Vec<StepEvent>) -> Self {
        Self {
            events,
            delay: Duration::ZERO,
            simulate_streaming: false,
        }
    }

    /// Pause between emitted events (and between simulated tokens).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stream plan, thought, and plain-text answer word by word before each
    /// completed event.
    pub fn with_simulated_streaming(mut self, enabled: bool) -> Self {
        self.simulate_streaming = enabled;
        self
    }

    pub fn events(&self) -> &[StepEvent] {
        &self.events
    }

    /// Parse a script: either a JSON array of events or one event per line.
    /// Entries that fail to parse are logged and skipped.
    pub fn from_json(text: &str) -> Self {
        let trimmed = text.trim_start();
        let values: Vec<serde_json::Value> = if trimmed.starts_with('[') {
            match serde_json::from_str(trimmed) {
                Ok(values) => values,
                Err(e) => {
                    warn!(%e, "Script is not a valid JSON array");
                    Vec::new()
                }
            }
        } else {
            trimmed
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .filter_map(|(n, line)| match serde_json::from_str(line) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(line = n + 1, %e, "Skipping malformed script line");
                        None
                    }
                })
                .collect()
        };

        let events = values
            .into_iter()
            .enumerate()
            .filter_map(|(n, value)| match serde_json::from_value::<StepEvent>(value) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(entry = n, %e, "Skipping malformed step event");
                    None
                }
            })
            .collect();

        Self::new(events)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text))
    }

    /// A short plan → search → answer run.
    pub fn demo() -> Self {
        let script = serde_json::json!([
            {"type": "planning", "plan": "1. Search the web for the capital of France.\n2. Confirm the result.\n3. Give the final answer."},
            {"type": "action",
             "thought": "I will search for the capital of France.",
             "tool_calls": [{"name": "web_search", "arguments": {"query": "capital of France"}}],
             "observations": "Paris is the capital and most populous city of France.",
             "duration_ms": 1200, "input_tokens": 812, "output_tokens": 64},
            {"type": "action",
             "thought": "Let me double check with a short computation.",
             "code": "result = web_search('capital of France')\nprint(result.splitlines()[0])",
             "observations": "Paris",
             "duration_ms": 900},
            {"type": "final_answer",
             "answer": {"title": "Capital", "content": "Paris", "sources": ["https://en.wikipedia.org/wiki/Paris"]}}
        ]);
        Self::from_json(&script.to_string())
            .with_delay(Duration::from_millis(40))
            .with_simulated_streaming(true)
    }

    /// Sleep for the configured delay unless cancelled first. Returns false on cancel.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        if self.delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.delay) => true,
        }
    }

    fn streamed_text(event: &StepEvent) -> Option<(StepKind, &str)> {
        match event {
            StepEvent::Planning(step) => Some((StepKind::Planning, step.plan.as_str())),
            StepEvent::Action(step) => step
                .thought
                .as_deref()
                .map(|thought| (StepKind::Action, thought)),
            StepEvent::FinalAnswer(step) => step
                .answer
                .as_str()
                .map(|answer| (StepKind::Answer, answer)),
            _ => None,
        }
    }
}

#[async_trait]
impl StepSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        query: String,
        events: StepSender,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        debug!(%query, steps = self.events.len(), "Scripted run started");

        for event in &self.events {
            if self.simulate_streaming {
                if let Some((kind, text)) = Self::streamed_text(event) {
                    if events.send(StepEvent::StepStarted { kind }).is_err() {
                        return Ok(());
                    }
                    for word in text.split_inclusive(' ') {
                        if !self.pause(&cancel).await {
                            return Ok(());
                        }
                        let delta = StepEvent::ModelDelta {
                            text: word.to_string(),
                        };
                        if events.send(delta).is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            if !self.pause(&cancel).await {
                debug!("Scripted run cancelled");
                return Ok(());
            }
            if events.send(event.clone()).is_err() {
                // Receiver gone; nobody is listening any more.
                return Ok(());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_array_skips_malformed() {
        let source = ScriptedSource::from_json(
            r#"[
                {"type": "planning", "plan": "p"},
                {"type": "teleport"},
                {"type": "final_answer", "answer": "Paris"}
            ]"#,
        );
        assert_eq!(source.events().len(), 2);
    }

    #[test]
    fn test_from_json_lines() {
        let source = ScriptedSource::from_json(
            "{\"type\": \"step_started\", \"kind\": \"action\"}\nnot json\n\n{\"type\": \"model_delta\", \"text\": \"hi\"}\n",
        );
        assert_eq!(source.events().len(), 2);
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(&path, r#"[{"type": "final_answer", "answer": "done"}]"#).unwrap();
        let source = ScriptedSource::from_path(&path).unwrap();
        assert_eq!(source.events().len(), 1);
    }

    #[test]
    fn test_demo_script_parses() {
        let source = ScriptedSource::demo();
        assert_eq!(source.events().len(), 4);
    }

    #[tokio::test]
    async fn test_simulated_streaming_emits_deltas() {
        let source = ScriptedSource::from_json(r#"[{"type": "action", "thought": "a b c"}]"#)
            .with_simulated_streaming(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        source
            .run("q".into(), tx, CancellationToken::new())
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received[0],
            StepEvent::StepStarted {
                kind: StepKind::Action
            }
        );
        let deltas: String = received
            .iter()
            .filter_map(|e| match e {
                StepEvent::ModelDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "a b c");
        assert!(matches!(received.last(), Some(StepEvent::Action(_))));
    }

    #[tokio::test]
    async fn test_plain_answer_streams_under_answer_kind() {
        let source = ScriptedSource::from_json(
            r#"[{"type": "final_answer", "answer": "Paris"}, {"type": "final_answer", "answer": {"title": "t"}}]"#,
        )
        .with_simulated_streaming(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        source
            .run("q".into(), tx, CancellationToken::new())
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received[0],
            StepEvent::StepStarted {
                kind: StepKind::Answer
            }
        );
        // structured answers are not streamed
        let starts = received
            .iter()
            .filter(|e| matches!(e, StepEvent::StepStarted { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_source_stops() {
        let source = ScriptedSource::demo();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        source.run("q".into(), tx, cancel).await.unwrap();
        // Only the first StepStarted can slip out before the first pause.
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert!(count <= 1);
    }
}
