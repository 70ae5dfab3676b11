//! Message encoder: turns step events into run messages.
//!
//! The encoder is stateless apart from its settings; everything that changes
//! during a run (phase, step counter, the open stream) lives in [`RunContext`]
//! and is threaded through every call.

use run_relay_core::config::Config;
use run_relay_core::message::{
    MessageMetadata, MessageStatus, MessageType, PlanningType, Role, RunMessage,
};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{ActionStep, FinalAnswerStep, PlanningStep, StepEvent, StepKind};

/// Why an event could not be encoded. The event is skipped; the run goes on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("run already produced its final message")]
    RunFinished,

    #[error("invalid step event: {0}")]
    InvalidEvent(String),
}

/// Whether the agent is currently planning or acting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    Planning,
    #[default]
    Action,
    /// Writing the final answer.
    Answer,
}

impl Phase {
    fn stream_type(self) -> MessageType {
        match self {
            Phase::Planning => MessageType::PlanningContent,
            Phase::Action => MessageType::ActionThought,
            Phase::Answer => MessageType::FinalAnswer,
        }
    }
}

impl From<StepKind> for Phase {
    fn from(kind: StepKind) -> Self {
        match kind {
            StepKind::Planning => Phase::Planning,
            StepKind::Action => Phase::Action,
            StepKind::Answer => Phase::Answer,
        }
    }
}

#[derive(Debug, Clone)]
struct OpenStream {
    message_id: String,
    message_type: MessageType,
    content: String,
}

/// Per-run encoder state.
#[derive(Debug, Clone)]
pub struct RunContext {
    session_id: String,
    phase: Phase,
    step_number: u32,
    step_open: bool,
    plans_seen: u32,
    open_stream: Option<OpenStream>,
    finished: bool,
}

impl RunContext {
    /// `start_step` is the session's highest step so far; steps of this run
    /// are numbered after it so step numbers never decrease within a session.
    pub fn new(session_id: impl Into<String>, start_step: u32) -> Self {
        Self {
            session_id: session_id.into(),
            phase: Phase::default(),
            step_number: start_step,
            step_open: false,
            plans_seen: 0,
            open_stream: None,
            finished: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn step_number(&self) -> u32 {
        self.step_number
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_streaming(&self) -> bool {
        self.open_stream.is_some()
    }
}

/// Encoder limits, usually read from [`Config`].
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub preview_chars: usize,
    pub tool_args_chars: usize,
    pub code_language: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            preview_chars: 120,
            tool_args_chars: 80,
            code_language: "python".into(),
        }
    }
}

impl EncoderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            preview_chars: config.preview_chars(),
            tool_args_chars: config.tool_args_chars(),
            code_language: config.code_language(),
        }
    }
}

/// Truncate `text` to `budget` characters, appending an ellipsis when cut.
pub fn truncate_preview(text: &str, budget: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let cut: String = text.chars().take(budget).collect();
    format!("{}...", cut.trim_end())
}

/// Short one-line summary of tool arguments.
pub fn summarize_arguments(arguments: &Value, budget: usize) -> String {
    let summary = match arguments {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}={s}"),
                other => format!("{key}={other}"),
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    };
    truncate_preview(&summary, budget)
}

/// Fields lifted out of a structured final answer.
#[derive(Debug, Clone, PartialEq)]
struct StructuredAnswer {
    title: Option<String>,
    content: Option<String>,
    sources: Vec<Value>,
}

fn extract_structured(answer: &Value) -> Option<StructuredAnswer> {
    let map = answer.as_object()?;
    let title = map.get("title");
    let body = map.get("content").or_else(|| map.get("body"));
    let sources = map.get("sources");
    if title.is_none() && body.is_none() && sources.is_none() {
        return None;
    }

    let text_of = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let sources = match sources {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other.clone()],
    };

    Some(StructuredAnswer {
        title: title.filter(|v| !v.is_null()).map(text_of),
        content: body.filter(|v| !v.is_null()).map(text_of),
        sources,
    })
}

/// Converts step events into run messages.
#[derive(Debug, Clone, Default)]
pub struct MessageEncoder {
    settings: EncoderSettings,
}

impl MessageEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Record the user's query as the first message of a run.
    pub fn user_query(&self, ctx: &RunContext, query: &str) -> RunMessage {
        let mut metadata = MessageMetadata::of_type(MessageType::UserQuery);
        metadata.status = Some(MessageStatus::Done);
        RunMessage::new(&ctx.session_id, ctx.step_number, Role::User, query, metadata)
    }

    /// Encode one step event.
    pub fn encode(
        &self,
        ctx: &mut RunContext,
        event: StepEvent,
    ) -> Result<Vec<RunMessage>, EncodeError> {
        if ctx.finished {
            return Err(EncodeError::RunFinished);
        }

        match event {
            StepEvent::StepStarted { kind: StepKind::Answer } => Ok(self.begin_answer(ctx)),
            StepEvent::StepStarted { kind } => Ok(self.begin_step(ctx, kind.into())),
            StepEvent::ModelDelta { text } => Ok(self.stream_delta(ctx, &text)),
            StepEvent::Planning(step) => Ok(self.encode_planning(ctx, step)),
            StepEvent::Action(step) => self.encode_action(ctx, step),
            StepEvent::FinalAnswer(step) => Ok(self.encode_final_answer(ctx, step)),
        }
    }

    /// Close out a run that ended without a final answer.
    pub fn finish(&self, ctx: &mut RunContext) -> Vec<RunMessage> {
        let out = self.close_stream(ctx).into_iter().collect();
        ctx.finished = true;
        out
    }

    /// Terminal message for a cancelled run.
    pub fn cancelled(&self, ctx: &mut RunContext) -> Vec<RunMessage> {
        if ctx.finished {
            return Vec::new();
        }
        let mut out: Vec<RunMessage> = self.close_stream(ctx).into_iter().collect();
        let mut metadata = MessageMetadata::of_type(MessageType::FinalAnswer);
        metadata.cancelled = true;
        metadata.status = Some(MessageStatus::Done);
        out.push(self.message(ctx, "Run cancelled.", metadata));
        ctx.finished = true;
        out
    }

    /// Terminal message for a run whose source failed.
    pub fn failed(&self, ctx: &mut RunContext, error: &str) -> Vec<RunMessage> {
        if ctx.finished {
            return Vec::new();
        }
        let mut out: Vec<RunMessage> = self.close_stream(ctx).into_iter().collect();
        let mut metadata = MessageMetadata::of_type(MessageType::FinalAnswer);
        metadata.error = true;
        metadata.error_message = Some(error.to_string());
        metadata.status = Some(MessageStatus::Error);
        out.push(self.message(ctx, format!("Run failed: {error}"), metadata));
        ctx.finished = true;
        out
    }

    fn message(&self, ctx: &RunContext, content: impl Into<String>, metadata: MessageMetadata) -> RunMessage {
        RunMessage::new(
            &ctx.session_id,
            ctx.step_number,
            Role::Assistant,
            content,
            metadata,
        )
    }

    /// Switch phase and advance the step counter. Planning steps announce
    /// themselves with a header so it precedes any streamed plan text.
    fn begin_step(&self, ctx: &mut RunContext, phase: Phase) -> Vec<RunMessage> {
        let mut out: Vec<RunMessage> = self.close_stream(ctx).into_iter().collect();
        out.extend(self.open_step(ctx, phase));
        out
    }

    fn open_step(&self, ctx: &mut RunContext, phase: Phase) -> Vec<RunMessage> {
        let mut out = Vec::new();
        ctx.phase = phase;
        ctx.step_number += 1;
        ctx.step_open = true;
        debug!(step = ctx.step_number, ?phase, "Step started");

        if phase == Phase::Planning {
            let mut metadata = MessageMetadata::of_type(MessageType::PlanningHeader);
            metadata.planning_type = Some(self.planning_type(ctx));
            out.push(self.message(ctx, "", metadata));
        }
        out
    }

    /// The answer is not a step: the counter stays, only the phase moves.
    fn begin_answer(&self, ctx: &mut RunContext) -> Vec<RunMessage> {
        let out = self.close_stream(ctx).into_iter().collect();
        ctx.phase = Phase::Answer;
        ctx.step_open = true;
        debug!(step = ctx.step_number, "Final answer started");
        out
    }

    /// Implicitly start a step for a completed event that was not announced.
    /// Output already streamed outside any step belongs to this one, so the
    /// open stream is relabelled and left for the completed message to take.
    fn ensure_step(&self, ctx: &mut RunContext, phase: Phase) -> Vec<RunMessage> {
        if ctx.step_open && ctx.phase == phase {
            return Vec::new();
        }
        if !ctx.step_open {
            if let Some(stream) = ctx.open_stream.as_mut() {
                stream.message_type = phase.stream_type();
                return self.open_step(ctx, phase);
            }
        }
        self.begin_step(ctx, phase)
    }

    /// Phase used to label streamed output. Between steps nothing has been
    /// announced yet; an action step is what normally follows.
    fn stream_phase(&self, ctx: &RunContext) -> Phase {
        if ctx.step_open {
            ctx.phase
        } else {
            Phase::Action
        }
    }

    fn planning_type(&self, ctx: &RunContext) -> PlanningType {
        if ctx.plans_seen == 0 {
            PlanningType::Initial
        } else {
            PlanningType::Update
        }
    }

    fn stream_delta(&self, ctx: &mut RunContext, text: &str) -> Vec<RunMessage> {
        if text.is_empty() {
            return Vec::new();
        }

        let (message_id, message_type, content, is_delta) = match ctx.open_stream.as_mut() {
            Some(stream) => {
                stream.content.push_str(text);
                (
                    stream.message_id.clone(),
                    stream.message_type,
                    stream.content.clone(),
                    true,
                )
            }
            None => {
                let message_type = self.stream_phase(ctx).stream_type();
                let message_id = run_relay_core::message::new_message_id();
                ctx.open_stream = Some(OpenStream {
                    message_id: message_id.clone(),
                    message_type,
                    content: text.to_string(),
                });
                (message_id, message_type, text.to_string(), false)
            }
        };

        let mut metadata = MessageMetadata::of_type(message_type);
        metadata.streaming = true;
        metadata.is_delta = is_delta;
        metadata.stream_id = Some(message_id.clone());
        metadata.status = Some(MessageStatus::Thinking);
        metadata.preview = Some(truncate_preview(&content, self.settings.preview_chars));
        if message_type == MessageType::PlanningContent {
            metadata.planning_type = Some(self.planning_type(ctx));
        }

        let mut message = self.message(ctx, content, metadata);
        message.message_id = message_id;
        vec![message]
    }

    /// Terminal fragment for a stream no complete message will replace.
    fn close_stream(&self, ctx: &mut RunContext) -> Option<RunMessage> {
        let stream = ctx.open_stream.take()?;
        let mut metadata = MessageMetadata::of_type(stream.message_type);
        metadata.is_delta = true;
        metadata.stream_id = Some(stream.message_id.clone());
        metadata.status = Some(MessageStatus::Done);
        metadata.preview = Some(truncate_preview(&stream.content, self.settings.preview_chars));

        let mut message = self.message(ctx, stream.content, metadata);
        message.message_id = stream.message_id;
        Some(message)
    }

    /// Take the open stream so a complete message can replace it.
    fn take_stream_id(&self, ctx: &mut RunContext) -> Option<String> {
        ctx.open_stream.take().map(|s| s.message_id)
    }

    fn encode_planning(&self, ctx: &mut RunContext, step: PlanningStep) -> Vec<RunMessage> {
        let mut out = self.ensure_step(ctx, Phase::Planning);

        let mut metadata = MessageMetadata::of_type(MessageType::PlanningContent);
        metadata.planning_type = Some(self.planning_type(ctx));
        metadata.preview = Some(truncate_preview(&step.plan, self.settings.preview_chars));
        metadata.stream_id = self.take_stream_id(ctx);
        metadata.status = Some(MessageStatus::Done);
        if let Some(error) = step.error {
            metadata.error = true;
            metadata.error_message = Some(error);
            metadata.status = Some(MessageStatus::Error);
        }
        out.push(self.message(ctx, step.plan, metadata));

        ctx.plans_seen += 1;
        ctx.step_open = false;
        out
    }

    fn encode_action(
        &self,
        ctx: &mut RunContext,
        step: ActionStep,
    ) -> Result<Vec<RunMessage>, EncodeError> {
        if step.tool_calls.iter().any(|t| t.name.trim().is_empty()) {
            return Err(EncodeError::InvalidEvent(
                "tool call without a name".to_string(),
            ));
        }

        let mut out = self.ensure_step(ctx, Phase::Action);

        match step.thought.filter(|t| !t.trim().is_empty()) {
            Some(thought) => {
                let mut metadata = MessageMetadata::of_type(MessageType::ActionThought);
                metadata.preview = Some(truncate_preview(&thought, self.settings.preview_chars));
                metadata.stream_id = self.take_stream_id(ctx);
                metadata.status = Some(MessageStatus::Done);
                out.push(self.message(ctx, thought, metadata));
            }
            None => out.extend(self.close_stream(ctx)),
        }

        for tool in &step.tool_calls {
            let args = summarize_arguments(&tool.arguments, self.settings.tool_args_chars);
            let content = if args.is_empty() {
                format!("Calling tool: {}", tool.name)
            } else {
                format!("Calling tool: {}({args})", tool.name)
            };
            let mut metadata = MessageMetadata::of_type(MessageType::ToolCall);
            metadata.tool_name = Some(tool.name.clone());
            metadata.tool_args = Some(args);
            metadata.status = Some(MessageStatus::Pending);
            out.push(self.message(ctx, content, metadata));
        }

        if let Some(code) = step.code.filter(|c| !c.trim().is_empty()) {
            let language = step
                .language
                .clone()
                .unwrap_or_else(|| self.settings.code_language.clone());
            let mut metadata = MessageMetadata::of_type(MessageType::CodeAction);
            metadata.preview = Some(truncate_preview(&code, self.settings.preview_chars));
            metadata.language = Some(language.clone());
            metadata.status = Some(MessageStatus::Pending);
            let fenced = format!("```{language}\n{}\n```", code.trim_end());
            out.push(self.message(ctx, fenced, metadata));
        }

        let observations = step.observations.filter(|o| !o.trim().is_empty());
        if observations.is_some() || step.error.is_some() {
            let mut content = observations.unwrap_or_default();
            let mut metadata = MessageMetadata::of_type(MessageType::ExecutionLog);
            metadata.status = Some(MessageStatus::Done);
            if let Some(error) = &step.error {
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(&format!("Error: {error}"));
                metadata.error = true;
                metadata.error_message = Some(error.clone());
                metadata.status = Some(MessageStatus::Error);
            }
            metadata.preview = Some(truncate_preview(&content, self.settings.preview_chars));
            out.push(self.message(ctx, content, metadata));
        }

        let mut footer = format!("Step {}", ctx.step_number);
        if let Some(ms) = step.duration_ms {
            footer.push_str(&format!(" | Duration: {:.2}s", ms as f64 / 1000.0));
        }
        if let (Some(input), Some(output)) = (step.input_tokens, step.output_tokens) {
            footer.push_str(&format!(" | Input tokens: {input} | Output tokens: {output}"));
        }
        let mut metadata = MessageMetadata::of_type(MessageType::StepFooter);
        metadata.status = Some(MessageStatus::Done);
        metadata.duration_ms = step.duration_ms;
        metadata.input_tokens = step.input_tokens;
        metadata.output_tokens = step.output_tokens;
        out.push(self.message(ctx, footer, metadata));
        out.push(self.message(ctx, "", MessageMetadata::of_type(MessageType::Separator)));

        ctx.step_open = false;
        Ok(out)
    }

    fn encode_final_answer(&self, ctx: &mut RunContext, step: FinalAnswerStep) -> Vec<RunMessage> {
        let mut metadata = MessageMetadata::of_type(MessageType::FinalAnswer);
        metadata.stream_id = self.take_stream_id(ctx);
        metadata.status = Some(MessageStatus::Done);

        let content = match extract_structured(&step.answer) {
            Some(structured) => {
                metadata.has_structured_data = true;
                metadata.answer_title = structured.title;
                metadata.answer_content = structured.content;
                metadata.answer_sources = Some(structured.sources);
                String::new()
            }
            None => match step.answer {
                Value::Null => String::new(),
                Value::String(text) => text,
                other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
            },
        };
        if !content.is_empty() {
            metadata.preview = Some(truncate_preview(&content, self.settings.preview_chars));
        }
        if let Some(error) = step.error {
            metadata.error = true;
            metadata.error_message = Some(error);
            metadata.status = Some(MessageStatus::Error);
        }

        ctx.step_open = false;
        ctx.finished = true;
        vec![self.message(ctx, content, metadata)]
    }
}
