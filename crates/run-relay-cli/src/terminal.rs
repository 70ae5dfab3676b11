//! Plain-text display surface for the terminal.

use std::collections::HashMap;

use run_relay_client::{DisplaySurface, View};
use run_relay_core::message::{PlanningType, Role, RunMessage};

/// Prints each entry once per distinct content. A terminal cannot take lines
/// back, so `clear` is a no-op and a resync prints only entries that changed.
pub struct TerminalSurface {
    label: &'static str,
    printed: HashMap<String, String>,
}

impl TerminalSurface {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            printed: HashMap::new(),
        }
    }

    fn format(&self, message: &RunMessage, view: &View) -> String {
        match view {
            View::Heading(PlanningType::Initial) => "== Initial plan ==".to_string(),
            View::Heading(PlanningType::Update) => "== Updated plan ==".to_string(),
            View::Structured(answer) => {
                let mut out = String::new();
                if let Some(title) = &answer.title {
                    out.push_str(&format!("** {title} **\n"));
                }
                if let Some(content) = &answer.content {
                    out.push_str(content);
                }
                for source in &answer.sources {
                    let text = source
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| source.to_string());
                    out.push_str(&format!("\n  source: {text}"));
                }
                out
            }
            View::Text if message.role == Role::User => format!("> {}", message.content),
            View::Text => message.content.clone(),
        }
    }
}

impl DisplaySurface for TerminalSurface {
    fn render(&mut self, display_id: &str, message: &RunMessage, view: &View) {
        let text = self.format(message, view);
        if self.printed.get(display_id) == Some(&text) {
            return;
        }
        println!("[{}] {}", self.label, text);
        self.printed.insert(display_id.to_string(), text);
    }

    fn clear(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use run_relay_client::router::StructuredAnswer;
    use run_relay_core::message::{MessageMetadata, MessageType};

    #[test]
    fn test_format_structured_answer() {
        let surface = TerminalSurface::new("chat");
        let message = RunMessage::new(
            "s1",
            1,
            Role::Assistant,
            "",
            MessageMetadata::of_type(MessageType::FinalAnswer),
        );
        let view = View::Structured(StructuredAnswer {
            title: Some("Capital".into()),
            content: Some("Paris".into()),
            sources: vec![serde_json::json!("https://example.org")],
        });
        assert_eq!(
            surface.format(&message, &view),
            "** Capital **\nParis\n  source: https://example.org"
        );
    }
}
