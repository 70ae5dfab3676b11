//! Router: picks exactly one display surface for each non-structural message.

use serde_json::Value;

use run_relay_core::message::{Component, MessageType, PlanningType, RunMessage};

/// Independent display targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Chat,
    Code,
    Log,
}

/// Fields of a structured final answer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredAnswer {
    pub title: Option<String>,
    pub content: Option<String>,
    pub sources: Vec<Value>,
}

/// How a surface should render the message.
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    Text,
    Heading(PlanningType),
    Structured(StructuredAnswer),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub surface: Surface,
    pub view: View,
}

fn surface_of(component: Component) -> Option<Surface> {
    match component {
        Component::Chat => Some(Surface::Chat),
        Component::CodeSurface => Some(Surface::Code),
        Component::LogSurface => Some(Surface::Log),
        Component::Unknown => None,
    }
}

/// Compatibility fallback for messages that name no component.
fn sniff(content: &str) -> Surface {
    if content.contains("```") {
        Surface::Code
    } else {
        Surface::Chat
    }
}

/// Route a message, or `None` if it is structural and should not be displayed.
pub fn route(message: &RunMessage) -> Option<Route> {
    let message_type = message.message_type();
    let empty = message.content.trim().is_empty();

    let view = match message_type {
        Some(MessageType::Separator) => return None,
        Some(MessageType::Unknown) | None if empty => return None,
        Some(MessageType::FinalAnswer) if message.metadata.has_structured_data => {
            View::Structured(StructuredAnswer {
                title: message.metadata.answer_title.clone(),
                content: message.metadata.answer_content.clone(),
                sources: message.metadata.answer_sources.clone().unwrap_or_default(),
            })
        }
        Some(MessageType::PlanningHeader) => View::Heading(
            message
                .metadata
                .planning_type
                .unwrap_or(PlanningType::Initial),
        ),
        Some(
            MessageType::UserQuery
            | MessageType::PlanningContent
            | MessageType::ActionThought
            | MessageType::ToolCall
            | MessageType::CodeAction
            | MessageType::ExecutionLog
            | MessageType::FinalAnswer
            | MessageType::StepFooter
            | MessageType::Unknown,
        )
        | None => View::Text,
    };

    // Metadata is authoritative; sniffing only covers messages that name nothing.
    let surface = message
        .metadata
        .component
        .and_then(surface_of)
        .or_else(|| message_type.and_then(|t| t.default_component()).and_then(surface_of))
        .unwrap_or_else(|| sniff(&message.content));

    Some(Route { surface, view })
}

/// A display target fed by the router.
pub trait DisplaySurface: Send {
    /// Show or refresh the entry `display_id` with the message's current content.
    fn render(&mut self, display_id: &str, message: &RunMessage, view: &View);

    /// Drop everything shown, before a resync redraws it.
    fn clear(&mut self);
}

/// The three surfaces, dispatched to independently.
pub struct Surfaces {
    pub chat: Box<dyn DisplaySurface>,
    pub code: Box<dyn DisplaySurface>,
    pub log: Box<dyn DisplaySurface>,
}

impl Surfaces {
    pub fn new(
        chat: Box<dyn DisplaySurface>,
        code: Box<dyn DisplaySurface>,
        log: Box<dyn DisplaySurface>,
    ) -> Self {
        Self { chat, code, log }
    }

    fn get_mut(&mut self, surface: Surface) -> &mut dyn DisplaySurface {
        match surface {
            Surface::Chat => self.chat.as_mut(),
            Surface::Code => self.code.as_mut(),
            Surface::Log => self.log.as_mut(),
        }
    }

    /// Route and render one entry. Returns the surface it went to.
    pub fn dispatch(&mut self, display_id: &str, message: &RunMessage) -> Option<Surface> {
        let route = route(message)?;
        self.get_mut(route.surface)
            .render(display_id, message, &route.view);
        Some(route.surface)
    }

    pub fn clear(&mut self) {
        self.chat.clear();
        self.code.clear();
        self.log.clear();
    }
}

/// Keeps the latest rendering of each entry, in first-rendered order.
#[derive(Debug, Default, Clone)]
pub struct MemorySurface {
    order: Vec<String>,
    rendered: std::collections::HashMap<String, (String, View)>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(display_id, content, view)` in display order.
    pub fn items(&self) -> Vec<(&str, &str, &View)> {
        self.order
            .iter()
            .filter_map(|id| {
                self.rendered
                    .get(id)
                    .map(|(content, view)| (id.as_str(), content.as_str(), view))
            })
            .collect()
    }
}

impl DisplaySurface for MemorySurface {
    fn render(&mut self, display_id: &str, message: &RunMessage, view: &View) {
        if !self.rendered.contains_key(display_id) {
            self.order.push(display_id.to_string());
        }
        self.rendered.insert(
            display_id.to_string(),
            (message.content.clone(), view.clone()),
        );
    }

    fn clear(&mut self) {
        self.order.clear();
        self.rendered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use run_relay_core::message::{MessageMetadata, Role};

    fn msg(metadata: MessageMetadata, content: &str) -> RunMessage {
        RunMessage::new("s1", 1, Role::Assistant, content, metadata)
    }

    #[test]
    fn test_component_is_authoritative() {
        let mut metadata = MessageMetadata::of_type(MessageType::ActionThought);
        metadata.component = Some(Component::LogSurface);
        let route = route(&msg(metadata, "```python\nx\n```")).unwrap();
        assert_eq!(route.surface, Surface::Log);
    }

    #[test]
    fn test_type_default_then_sniffing() {
        let mut metadata = MessageMetadata::of_type(MessageType::CodeAction);
        metadata.component = None;
        assert_eq!(route(&msg(metadata, "x = 1")).unwrap().surface, Surface::Code);

        let untyped = MessageMetadata::default();
        assert_eq!(
            route(&msg(untyped.clone(), "```\nls\n```")).unwrap().surface,
            Surface::Code
        );
        assert_eq!(route(&msg(untyped, "plain")).unwrap().surface, Surface::Chat);
    }

    #[test]
    fn test_unknown_component_falls_back() {
        let mut metadata = MessageMetadata::of_type(MessageType::ExecutionLog);
        metadata.component = Some(Component::Unknown);
        assert_eq!(route(&msg(metadata, "out")).unwrap().surface, Surface::Log);
    }

    #[test]
    fn test_structural_messages_filtered() {
        assert!(route(&msg(MessageMetadata::of_type(MessageType::Separator), "")).is_none());
        assert!(route(&msg(MessageMetadata::of_type(MessageType::Separator), "---")).is_none());
        assert!(route(&msg(MessageMetadata::default(), "  ")).is_none());
        assert!(route(&msg(MessageMetadata::of_type(MessageType::Unknown), "")).is_none());
        // unknown kinds with content are still shown
        assert!(route(&msg(MessageMetadata::of_type(MessageType::Unknown), "hi")).is_some());
    }

    #[test]
    fn test_planning_header_routes_as_heading() {
        let mut metadata = MessageMetadata::of_type(MessageType::PlanningHeader);
        metadata.planning_type = Some(PlanningType::Update);
        let route = route(&msg(metadata, "")).unwrap();
        assert_eq!(route.view, View::Heading(PlanningType::Update));
        assert_eq!(route.surface, Surface::Chat);
    }

    #[test]
    fn test_surfaces_dispatch_independently() {
        struct Counting(std::sync::Arc<std::sync::atomic::AtomicUsize>);
        impl DisplaySurface for Counting {
            fn render(&mut self, _: &str, _: &RunMessage, _: &View) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            fn clear(&mut self) {}
        }

        let chat = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let code = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut surfaces = Surfaces::new(
            Box::new(Counting(chat.clone())),
            Box::new(Counting(code.clone())),
            Box::new(MemorySurface::new()),
        );

        let code_msg = msg(MessageMetadata::of_type(MessageType::CodeAction), "```\nx\n```");
        assert_eq!(surfaces.dispatch("a", &code_msg), Some(Surface::Code));
        let sep = msg(MessageMetadata::of_type(MessageType::Separator), "");
        assert_eq!(surfaces.dispatch("b", &sep), None);

        assert_eq!(chat.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(code.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
