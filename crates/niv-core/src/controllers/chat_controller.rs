use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::models::{
    Conversation, ConversationsStore, MessageAssembler, MessageList, SendRejection,
    SessionContext, next_id,
};
use crate::repositories::{ConversationRepository, RepositoryResult};
use crate::services::{StreamEvent, StreamOpener};
use crate::settings::ClientSettings;

/// Wires the session, the conversation store and the assembler together.
///
/// The controller owns the message list of the active conversation. Every
/// change to it is handed to the store, which persists it.
pub struct ChatController {
    session: SessionContext,
    store: ConversationsStore,
    assembler: MessageAssembler,
    messages: MessageList,
}

impl ChatController {
    pub fn new(
        mut session: SessionContext,
        store: ConversationsStore,
        opener: Arc<dyn StreamOpener>,
    ) -> Self {
        session.initialize(&store);
        let messages = session
            .active_conversation_id()
            .and_then(|id| store.get(id))
            .map(|c| MessageList::from_messages(c.messages().to_vec()))
            .unwrap_or_default();

        Self {
            session,
            store,
            assembler: MessageAssembler::new(opener),
            messages,
        }
    }

    /// Build a controller for a paired client, loading history from `repo`.
    pub async fn open(
        settings: &ClientSettings,
        opener: Arc<dyn StreamOpener>,
        repo: Arc<dyn ConversationRepository>,
    ) -> Result<Self> {
        let (Some(site_url), Some(token)) = (&settings.site_url, &settings.token) else {
            bail!("Not paired: run `niv pair` first");
        };

        let store = ConversationsStore::load(repo)
            .await
            .context("Failed to load conversations")?;
        let session = SessionContext::new(site_url.as_str(), token.as_str());
        Ok(Self::new(session, store, opener))
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn store(&self) -> &ConversationsStore {
        &self.store
    }

    /// Messages of the active conversation.
    pub fn messages(&self) -> &MessageList {
        &self.messages
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.session
            .active_conversation_id()
            .and_then(|id| self.store.get(id))
    }

    pub fn is_streaming(&self) -> bool {
        self.assembler.is_streaming()
    }

    pub fn assembler(&self) -> &MessageAssembler {
        &self.assembler
    }

    /// Start an empty conversation and make it active. It reaches the store
    /// with its first message.
    pub fn new_conversation(&mut self) -> String {
        self.stop();
        let id = next_id();
        self.messages = MessageList::new();
        self.session.set_active(id.clone());
        info!(conv_id = %id, "New conversation");
        id
    }

    /// Make `id` active. A reply still streaming elsewhere is stopped first.
    pub fn select_conversation(&mut self, id: &str) -> bool {
        if self.session.is_active(id) {
            return self.store.contains(id);
        }
        let Some(conversation) = self.store.get(id) else {
            return false;
        };
        let messages = MessageList::from_messages(conversation.messages().to_vec());

        self.stop();
        self.messages = messages;
        self.session.set_active(id);
        debug!(conv_id = %id, "Conversation selected");
        true
    }

    /// Send `text` in the active conversation, creating one when there is
    /// none. Returns the id of the reply being streamed.
    pub fn send(&mut self, text: &str) -> Result<String, SendRejection> {
        let active = self.session.active_conversation_id().map(str::to_string);
        let conversation_id = match active {
            Some(id) => id,
            None => {
                if text.trim().is_empty() {
                    return Err(SendRejection::EmptyMessage);
                }
                self.new_conversation()
            }
        };

        let reply_id = self
            .assembler
            .send(&conversation_id, &mut self.messages, text)?;
        self.sync();
        Ok(reply_id)
    }

    /// Apply the next stream event and persist the result. `None` once the
    /// reply has settled.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if !self.assembler.is_streaming() {
            return None;
        }
        let event = self.assembler.next_event(&mut self.messages).await;
        self.sync();
        event
    }

    /// Drive the current reply to completion, reporting each event.
    pub async fn run_until_settled(&mut self, mut on_event: impl FnMut(&StreamEvent)) {
        while let Some(event) = self.next_event().await {
            on_event(&event);
        }
    }

    /// Stop the streaming reply, keeping its partial content.
    pub fn stop(&mut self) -> bool {
        if !self.assembler.stop(&mut self.messages) {
            return false;
        }
        self.sync();
        true
    }

    /// Toggle a reaction on a message of the active conversation. Returns
    /// whether the reaction is now set, or `None` for an unknown message.
    pub fn toggle_reaction(&mut self, message_id: &str, tag: &str) -> Option<bool> {
        let set = self.messages.update(message_id, |m| m.toggle_reaction(tag))?;
        self.sync();
        Some(set)
    }

    pub fn set_pinned(&mut self, id: &str, pinned: bool) -> bool {
        self.store.set_pinned(id, pinned)
    }

    /// Delete a conversation. When it was active, the first remaining one
    /// becomes active.
    pub fn delete_conversation(&mut self, id: &str) -> bool {
        if self.assembler.streaming_conversation() == Some(id) {
            self.stop();
        }
        if !self.store.delete(id) {
            return false;
        }

        if self.session.is_active(id) {
            self.session.initialize(&self.store);
            self.messages = self
                .active_conversation()
                .map(|c| MessageList::from_messages(c.messages().to_vec()))
                .unwrap_or_default();
        }
        info!(conv_id = %id, active = ?self.session.active_conversation_id(), "Conversation deleted");
        true
    }

    pub fn search(&self, query: &str) -> Vec<&Conversation> {
        self.store.search(query)
    }

    /// End the session. With `wipe`, local history is removed as well.
    pub async fn logout(&mut self, wipe: bool) -> RepositoryResult<()> {
        self.stop();
        if wipe {
            self.store.clear();
        }
        self.session.teardown();
        self.messages = MessageList::new();
        info!(wipe, "Logged out");
        self.store.flush().await
    }

    /// Wait for pending writes.
    pub async fn flush(&self) -> RepositoryResult<()> {
        self.store.flush().await
    }

    fn sync(&mut self) {
        if let Some(id) = self.session.active_conversation_id() {
            let id = id.to_string();
            self.store.sync_messages(&id, &self.messages);
        }
    }
}
