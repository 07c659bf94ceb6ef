use breeze_llm::{EngineMessage, Role};
use breeze_storage::MessageId;
use serde::{Deserialize, Serialize};

use crate::reasoning::{has_reasoning_marker, split_reasoning};

/// One transcript entry, persisted as `{id, role, content, think?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think: Option<String>,
}

impl ChatMessage {
    /// Creates a message with a fresh id.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            think: None,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Assistant reply still carrying a reasoning marker and no extracted reasoning.
    pub fn needs_reasoning_split(&self) -> bool {
        self.is_assistant() && self.think.is_none() && has_reasoning_marker(&self.content)
    }

    /// Moves the first reasoning segment out of `content`.
    ///
    /// Returns false and leaves the message untouched for non-assistant messages, for
    /// messages that already carry reasoning, and when no marker is present.
    pub fn split_reasoning(&mut self) -> bool {
        if !self.is_assistant() || self.think.is_some() {
            return false;
        }

        let Some(split) = split_reasoning(&self.content) else {
            return false;
        };

        self.content = split.visible;
        self.think = split.think;
        true
    }

    pub fn to_engine_message(&self) -> EngineMessage {
        EngineMessage::new(self.role, self.content.clone())
    }
}
