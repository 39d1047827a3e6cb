use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, Role};

/// Longest title derived from the opening prompt, in characters.
pub const TITLE_MAX_CHARS: usize = 40;

/// Title used until the conversation has a user message.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Truncate text to max length
fn truncate_text(text: &str, max_len: usize) -> String {
    text.chars().take(max_len).collect()
}

/// Title for a message list: the first user prompt, truncated.
pub fn derive_title(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role() == Role::User)
        .map(|m| truncate_text(m.content(), TITLE_MAX_CHARS))
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

/// A persisted multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    id: String,
    title: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    pinned: bool,
    #[serde(rename = "created")]
    created_at: DateTime<Utc>,
}

impl Conversation {
    /// Create an unpinned conversation stamped with the current time.
    pub fn new(id: String, messages: Vec<Message>) -> Self {
        Self::with_created_at(id, messages, Utc::now())
    }

    pub fn with_created_at(id: String, messages: Vec<Message>, created_at: DateTime<Utc>) -> Self {
        let title = derive_title(&messages);
        Self {
            id,
            title,
            messages,
            pinned: false,
            created_at,
        }
    }

    /// Get conversation ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get conversation title
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Get creation timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the count of messages in history
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Replace the message history and recompute the title from it.
    pub(crate) fn replace_messages(&mut self, messages: Vec<Message>) {
        self.title = derive_title(&messages);
        self.messages = messages;
    }

    pub(crate) fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    pub(crate) fn title_matches(&self, needle_lowercase: &str) -> bool {
        self.title.to_lowercase().contains(needle_lowercase)
    }
}
