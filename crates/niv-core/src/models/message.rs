use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

fn sealed_by_default() -> bool {
    true
}

/// A single chat message.
///
/// User messages are sealed on creation. An assistant message starts empty and
/// unsealed; the streaming pipeline appends to `content` and `tools` until the
/// stream settles. Reactions stay editable after sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    role: Role,
    content: String,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default, with = "reaction_map")]
    reactions: BTreeSet<String>,
    #[serde(skip, default = "sealed_by_default")]
    sealed: bool,
}

impl Message {
    pub fn user(id: String, content: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::User,
            content: content.into(),
            tools: Vec::new(),
            reactions: BTreeSet::new(),
            sealed: true,
        }
    }

    /// Empty assistant message waiting for streamed content.
    pub fn pending_assistant(id: String) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: String::new(),
            tools: Vec::new(),
            reactions: BTreeSet::new(),
            sealed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub fn reactions(&self) -> &BTreeSet<String> {
        &self.reactions
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Append streamed text. Returns false once the message is sealed.
    pub fn append_content(&mut self, text: &str) -> bool {
        if self.sealed {
            return false;
        }
        self.content.push_str(text);
        true
    }

    /// Record a tool invoked while generating this message.
    pub fn push_tool(&mut self, name: impl Into<String>) -> bool {
        if self.sealed {
            return false;
        }
        self.tools.push(name.into());
        true
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Add the reaction if absent, remove it otherwise. Returns whether it is now set.
    pub fn toggle_reaction(&mut self, tag: &str) -> bool {
        if self.reactions.remove(tag) {
            false
        } else {
            self.reactions.insert(tag.to_string());
            true
        }
    }
}

/// Reactions persist as `{ "tag": true }`.
mod reaction_map {
    use std::collections::{BTreeMap, BTreeSet};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(tags: &BTreeSet<String>, serializer: S) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<&str, bool> = tags.iter().map(|tag| (tag.as_str(), true)).collect();
        map.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<String>, D::Error> {
        let map = BTreeMap::<String, bool>::deserialize(deserializer)?;
        Ok(map
            .into_iter()
            .filter_map(|(tag, on)| on.then_some(tag))
            .collect())
    }
}

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Ordered messages of one conversation, addressed by message id.
///
/// Every mutation takes a fresh version from a process-wide counter, so two
/// versions can be compared even across lists. Observers use it to ignore
/// stale states.
#[derive(Debug, Clone)]
pub struct MessageList {
    messages: Vec<Message>,
    version: u64,
}

impl MessageList {
    pub fn new() -> Self {
        Self::from_messages(Vec::new())
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            version: next_version(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.version = next_version();
    }

    /// Mutate the message with `id` in place. Returns `None` when no such message exists.
    pub fn update<T>(&mut self, id: &str, f: impl FnOnce(&mut Message) -> T) -> Option<T> {
        let message = self.messages.iter_mut().find(|m| m.id == id)?;
        let result = f(message);
        self.version = next_version();
        Some(result)
    }
}

impl Default for MessageList {
    fn default() -> Self {
        Self::new()
    }
}
