//! Conversation messages exchanged with the model.

use serde::{Deserialize, Serialize};

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One turn half in the conversation history.
///
/// `text` is what the UI shows. For user messages, `full_text` preserves
/// the originally-sent prompt body (including the embedded workspace
/// digest); the gateway and the history optimizer operate on that body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
}

impl ChatMessage {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            full_text: None,
        }
    }

    /// A user message whose sent body differed from the display text.
    #[must_use]
    pub fn user_with_prompt(text: impl Into<String>, full_text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            full_text: Some(full_text.into()),
        }
    }

    #[must_use]
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            full_text: None,
        }
    }

    /// The body actually sent to (or received from) the model.
    #[must_use]
    pub fn prompt_body(&self) -> &str {
        self.full_text.as_deref().unwrap_or(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_body_prefers_full_text() {
        let plain = ChatMessage::user("fix the bug");
        assert_eq!(plain.prompt_body(), "fix the bug");

        let composed = ChatMessage::user_with_prompt("fix the bug", "files...\nfix the bug");
        assert_eq!(composed.prompt_body(), "files...\nfix the bug");
    }
}
