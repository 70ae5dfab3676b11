//! Agent status tracker.

use std::fmt;

use run_relay_core::message::{MessageStatus, MessageType, PlanningType, RunMessage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AgentStatus {
    #[default]
    Standby,
    InitialPlanning,
    UpdatePlanning,
    Thinking,
    Coding,
    Running,
    Writing,
    Done,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Standby => "standby",
            AgentStatus::InitialPlanning => "initial-planning",
            AgentStatus::UpdatePlanning => "update-planning",
            AgentStatus::Thinking => "thinking",
            AgentStatus::Coding => "coding",
            AgentStatus::Running => "running",
            AgentStatus::Writing => "writing",
            AgentStatus::Done => "done",
            AgentStatus::Error => "error",
        }
    }

    /// Only a new user query leaves these.
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Done | AgentStatus::Error)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages that carry layout, not progress, never move the status.
pub fn is_structural(message: &RunMessage) -> bool {
    let message_type = message.message_type();
    if message_type.is_some_and(MessageType::is_structural) {
        return true;
    }
    message.metadata.status == Some(MessageStatus::Done)
        && message_type != Some(MessageType::FinalAnswer)
}

/// Status implied by a message, or `None` to keep the current one.
fn candidate(message: &RunMessage) -> Option<AgentStatus> {
    let planning = |message: &RunMessage| match message.metadata.planning_type {
        Some(PlanningType::Update) => AgentStatus::UpdatePlanning,
        Some(PlanningType::Initial) | None => AgentStatus::InitialPlanning,
    };

    match message.message_type() {
        Some(MessageType::UserQuery) => Some(AgentStatus::Standby),
        Some(MessageType::PlanningHeader | MessageType::PlanningContent) => Some(planning(message)),
        Some(MessageType::ActionThought) => Some(AgentStatus::Thinking),
        Some(MessageType::CodeAction) => Some(AgentStatus::Coding),
        Some(MessageType::ToolCall | MessageType::ExecutionLog) => Some(AgentStatus::Running),
        Some(MessageType::FinalAnswer) => Some(if message.is_streaming() {
            AgentStatus::Writing
        } else if message.metadata.error {
            AgentStatus::Error
        } else {
            AgentStatus::Done
        }),
        Some(MessageType::StepFooter | MessageType::Separator | MessageType::Unknown) => None,
        None => match message.metadata.status {
            Some(MessageStatus::Thinking) => Some(AgentStatus::Thinking),
            _ => None,
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    status: AgentStatus,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn reset(&mut self) {
        self.status = AgentStatus::Standby;
    }

    /// Fold one new or updated message into the status.
    pub fn observe(&mut self, message: &RunMessage) -> AgentStatus {
        if message.is_user_query() {
            self.status = AgentStatus::Standby;
            return self.status;
        }
        if self.status.is_terminal() || is_structural(message) {
            return self.status;
        }
        if let Some(next) = candidate(message) {
            self.status = next;
        }
        self.status
    }
}
