use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::conversation_repository::{BoxFuture, ConversationRepository};
use super::error::RepositoryResult;
use crate::models::Conversation;

/// In-memory repository for conversations
/// Useful for testing and development
#[derive(Clone, Default)]
pub struct InMemoryConversationRepository {
    conversations: Arc<Mutex<Vec<Conversation>>>,
    save_count: Arc<Mutex<usize>>,
    save_delay: Option<Duration>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository pre-filled with `conversations`.
    pub fn with_conversations(conversations: Vec<Conversation>) -> Self {
        let repo = Self::new();
        *repo.conversations.lock() = conversations;
        repo
    }

    /// Make every save take at least `delay`, to exercise overlapping writes.
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = Some(delay);
        self
    }

    /// Currently stored list.
    pub fn snapshot(&self) -> Vec<Conversation> {
        self.conversations.lock().clone()
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        *self.save_count.lock()
    }
}

impl ConversationRepository for InMemoryConversationRepository {
    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>> {
        let conversations = self.conversations.clone();

        Box::pin(async move { Ok(conversations.lock().clone()) })
    }

    fn save_all(&self, conversations: Vec<Conversation>) -> BoxFuture<'static, RepositoryResult<()>> {
        let store = self.conversations.clone();
        let save_count = self.save_count.clone();
        let delay = self.save_delay;

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            *store.lock() = conversations;
            *save_count.lock() += 1;
            Ok(())
        })
    }

    fn storage_path(&self) -> String {
        "memory".to_string()
    }
}
