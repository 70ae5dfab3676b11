//! Run message model: the unit of transcript shared by encoder, channel, and client.
//!
//! Every fragment on the wire is a full [`RunMessage`]. Streaming messages carry
//! their *cumulative* content; `metadata.is_delta` marks fragments that update a
//! previously announced message instead of announcing a new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    #[default]
    Assistant,
}

/// Routing target named by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "code-surface")]
    CodeSurface,
    #[serde(rename = "log-surface")]
    LogSurface,
    /// A component name this build does not know. Routed as if absent.
    #[serde(other)]
    Unknown,
}

/// Semantic kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    UserQuery,
    PlanningHeader,
    PlanningContent,
    ActionThought,
    ToolCall,
    CodeAction,
    ExecutionLog,
    FinalAnswer,
    StepFooter,
    Separator,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Surface a message of this kind belongs on when the encoder names none.
    pub fn default_component(self) -> Option<Component> {
        match self {
            MessageType::UserQuery
            | MessageType::PlanningHeader
            | MessageType::PlanningContent
            | MessageType::ActionThought
            | MessageType::ToolCall
            | MessageType::FinalAnswer
            | MessageType::StepFooter => Some(Component::Chat),
            MessageType::CodeAction => Some(Component::CodeSurface),
            MessageType::ExecutionLog => Some(Component::LogSurface),
            MessageType::Separator | MessageType::Unknown => None,
        }
    }

    /// Layout-only kinds that carry no agent progress.
    pub fn is_structural(self) -> bool {
        matches!(self, MessageType::Separator | MessageType::StepFooter)
    }
}

/// Lifecycle hint attached by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Thinking,
    Pending,
    Done,
    Error,
    #[serde(other)]
    Other,
}

/// Whether a plan is the run's first plan or a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningType {
    Initial,
    Update,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Open metadata map. Known keys are typed; anything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,

    /// More fragments may follow for this identity.
    #[serde(default, skip_serializing_if = "is_false")]
    pub streaming: bool,

    /// This fragment updates a previously announced message.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_delta: bool,

    /// Correlates a complete message with the streaming message it replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_type: Option<PlanningType>,

    /// Truncated preview of `content` for collapsed views.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub has_structured_data: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_sources: Option<Vec<serde_json::Value>>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub cancelled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    pub fn of_type(message_type: MessageType) -> Self {
        Self {
            component: message_type.default_component(),
            message_type: Some(message_type),
            ..Self::default()
        }
    }
}

/// One fragment of the run transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMessage {
    pub message_id: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub step_number: u32,
    #[serde(default)]
    pub metadata: MessageMetadata,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl RunMessage {
    /// Create a message with a fresh identity.
    pub fn new(
        session_id: &str,
        step_number: u32,
        role: Role,
        content: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            role,
            content: content.into(),
            session_id: session_id.to_string(),
            step_number,
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.metadata.message_type
    }

    pub fn is_delta(&self) -> bool {
        self.metadata.is_delta
    }

    pub fn is_streaming(&self) -> bool {
        self.metadata.streaming
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.metadata.stream_id.as_deref()
    }

    pub fn is_user_query(&self) -> bool {
        self.role == Role::User
    }
}

/// Generate an opaque message identity.
pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}
