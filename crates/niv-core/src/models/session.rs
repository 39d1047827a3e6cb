use tracing::debug;

use super::conversations_store::ConversationsStore;

/// Per-session state shared by the controller: where we talk to, with which
/// token, and which conversation is on screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    site_url: String,
    token: String,
    active_conversation_id: Option<String>,
}

impl SessionContext {
    pub fn new(site_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            site_url: site_url.into(),
            token: token.into(),
            active_conversation_id: None,
        }
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active_conversation_id.as_deref()
    }

    /// Pick the first conversation in display order, if there is one.
    pub fn initialize(&mut self, store: &ConversationsStore) {
        self.active_conversation_id = store.conversations().first().map(|c| c.id().to_string());
        debug!(active = ?self.active_conversation_id, "Session initialized");
    }

    pub fn set_active(&mut self, id: impl Into<String>) {
        self.active_conversation_id = Some(id.into());
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active_conversation_id.as_deref() == Some(id)
    }

    /// Forget the token and the active conversation.
    pub fn teardown(&mut self) {
        self.token.clear();
        self.active_conversation_id = None;
    }
}
