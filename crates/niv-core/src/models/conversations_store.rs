use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::conversation::Conversation;
use super::message::{Message, MessageList};
use crate::repositories::{ConversationRepository, RepositoryResult};
use crate::services::ConversationPersister;

/// Ordered collection of every conversation, and the only writer of it.
///
/// New conversations are prepended. Order otherwise changes only through the
/// pin partition. Every mutation hands a full snapshot to the persister, which
/// always writes the newest one.
pub struct ConversationsStore {
    conversations: Vec<Conversation>,
    /// Newest message-list version applied per conversation.
    synced_versions: HashMap<String, u64>,
    version: u64,
    persister: Option<ConversationPersister>,
}

impl ConversationsStore {
    /// Store without persistence.
    pub fn new() -> Self {
        Self {
            conversations: Vec::new(),
            synced_versions: HashMap::new(),
            version: 0,
            persister: None,
        }
    }

    /// Restore every conversation from `repo` in persisted order and keep
    /// writing changes back to it.
    pub async fn load(repo: Arc<dyn ConversationRepository>) -> RepositoryResult<Self> {
        let conversations = repo.load_all().await?;
        info!(
            count = conversations.len(),
            path = %repo.storage_path(),
            "Loaded conversations"
        );

        Ok(Self {
            conversations,
            synced_versions: HashMap::new(),
            version: 0,
            persister: Some(ConversationPersister::spawn(repo)),
        })
    }

    /// All conversations in display order.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Get a conversation by ID
    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Get count of conversations
    pub fn count(&self) -> usize {
        self.conversations.len()
    }

    /// Monotonic counter of store mutations.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace the whole list. Callers pass the complete intended list.
    pub fn save(&mut self, conversations: Vec<Conversation>) {
        self.synced_versions
            .retain(|id, _| conversations.iter().any(|c| c.id() == id));
        self.conversations = conversations;
        self.persist();
    }

    /// Create the conversation if needed, otherwise replace its messages. The
    /// title is recomputed either way.
    pub fn upsert_from_messages(&mut self, id: &str, messages: &[Message]) -> &Conversation {
        let index = match self.position(id) {
            Some(index) => {
                self.conversations[index].replace_messages(messages.to_vec());
                index
            }
            None => {
                debug!(conv_id = %id, "Creating conversation");
                self.conversations
                    .insert(0, Conversation::new(id.to_string(), messages.to_vec()));
                0
            }
        };
        self.persist();
        &self.conversations[index]
    }

    /// Observed-change trigger for a message list.
    ///
    /// Skips the write when `messages` is not newer than the last state applied
    /// for `id`, so an earlier state can never overwrite a later one. Returns
    /// whether the store changed.
    pub fn sync_messages(&mut self, id: &str, messages: &MessageList) -> bool {
        if let Some(&applied) = self.synced_versions.get(id)
            && messages.version() <= applied
        {
            debug!(
                conv_id = %id,
                version = messages.version(),
                applied,
                "Ignoring stale message list"
            );
            return false;
        }
        self.synced_versions
            .insert(id.to_string(), messages.version());
        self.upsert_from_messages(id, messages.as_slice());
        true
    }

    /// Set the pin flag, then move pinned conversations ahead of unpinned ones
    /// keeping relative order inside each group.
    pub fn set_pinned(&mut self, id: &str, pinned: bool) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.conversations[index].set_pinned(pinned);

        let (mut ordered, unpinned): (Vec<_>, Vec<_>) = std::mem::take(&mut self.conversations)
            .into_iter()
            .partition(|c| c.is_pinned());
        ordered.extend(unpinned);
        self.conversations = ordered;

        self.persist();
        true
    }

    /// Delete a conversation by ID. Choosing another active conversation is up
    /// to the caller.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.conversations.remove(index);
        self.synced_versions.remove(id);
        self.persist();
        true
    }

    /// Remove every conversation.
    pub fn clear(&mut self) {
        self.conversations.clear();
        self.synced_versions.clear();
        self.persist();
    }

    /// Case-insensitive substring match on titles, in display order.
    pub fn search(&self, query: &str) -> Vec<&Conversation> {
        let needle = query.to_lowercase();
        self.conversations
            .iter()
            .filter(|c| c.title_matches(&needle))
            .collect()
    }

    /// Wait until the newest snapshot has been written.
    pub async fn flush(&self) -> RepositoryResult<()> {
        match &self.persister {
            Some(persister) => persister.flush().await,
            None => Ok(()),
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.conversations.iter().position(|c| c.id() == id)
    }

    fn persist(&mut self) {
        self.version += 1;
        if let Some(persister) = &self.persister {
            persister.submit(self.version, self.conversations.clone());
        }
    }
}

impl Default for ConversationsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conversation::DEFAULT_TITLE;
    use crate::repositories::InMemoryConversationRepository;

    fn ids(store: &ConversationsStore) -> Vec<&str> {
        store.conversations().iter().map(|c| c.id()).collect()
    }

    fn store_with(ids: &[&str]) -> ConversationsStore {
        let mut store = ConversationsStore::new();
        // Prepending means insertion order is the reverse of display order.
        for id in ids.iter().rev() {
            store.upsert_from_messages(id, &[Message::user(format!("{id}-m"), *id)]);
        }
        store
    }

    #[test]
    fn test_upsert_prepends_new_conversations() {
        let mut store = ConversationsStore::new();
        store.upsert_from_messages("1", &[Message::user("a".into(), "first")]);
        store.upsert_from_messages("2", &[Message::user("b".into(), "second")]);
        assert_eq!(ids(&store), vec!["2", "1"]);

        let conv = store.get("1").unwrap();
        assert!(!conv.is_pinned());
        assert_eq!(conv.title(), "first");
    }

    #[test]
    fn test_upsert_replaces_messages_in_place() {
        let mut store = store_with(&["A", "B"]);
        let messages = vec![
            Message::user("x".into(), "Rewritten prompt"),
            Message::pending_assistant("y".into()),
        ];
        store.upsert_from_messages("B", &messages);

        assert_eq!(ids(&store), vec!["A", "B"]);
        let conv = store.get("B").unwrap();
        assert_eq!(conv.message_count(), 2);
        assert_eq!(conv.title(), "Rewritten prompt");
    }

    #[test]
    fn test_title_resets_when_user_messages_disappear() {
        let mut store = ConversationsStore::new();
        store.upsert_from_messages(
            "1",
            &[Message::user(
                "a".into(),
                "Hello there, how are things going today at the plant?",
            )],
        );
        assert_eq!(
            store.get("1").unwrap().title(),
            "Hello there, how are things going today "
        );

        store.upsert_from_messages("1", &[]);
        assert_eq!(store.get("1").unwrap().title(), DEFAULT_TITLE);
    }

    #[test]
    fn test_pin_is_a_stable_partition() {
        let mut store = store_with(&["A", "B", "C", "D"]);
        assert_eq!(ids(&store), vec!["A", "B", "C", "D"]);

        assert!(store.set_pinned("C", true));
        assert_eq!(ids(&store), vec!["C", "A", "B", "D"]);

        assert!(store.set_pinned("A", true));
        assert_eq!(ids(&store), vec!["C", "A", "B", "D"]);

        assert!(store.set_pinned("C", false));
        assert_eq!(ids(&store), vec!["A", "C", "B", "D"]);
    }

    #[test]
    fn test_pin_unknown_id_is_rejected() {
        let mut store = store_with(&["A"]);
        let version = store.version();
        assert!(!store.set_pinned("missing", true));
        assert_eq!(store.version(), version);
    }

    #[test]
    fn test_delete() {
        let mut store = store_with(&["A", "B", "C"]);
        assert!(store.delete("B"));
        assert!(!store.delete("B"));
        assert_eq!(ids(&store), vec!["A", "C"]);
    }

    #[test]
    fn test_search_is_case_insensitive_and_non_mutating() {
        let mut store = ConversationsStore::new();
        store.upsert_from_messages("1", &[Message::user("a".into(), "Sales report for March")]);
        store.upsert_from_messages("2", &[Message::user("b".into(), "Purchase orders")]);
        store.upsert_from_messages("3", &[Message::user("c".into(), "march payroll")]);

        let hits: Vec<&str> = store.search("MARCH").iter().map(|c| c.id()).collect();
        assert_eq!(hits, vec!["3", "1"]);
        assert_eq!(ids(&store), vec!["3", "2", "1"]);
        assert_eq!(store.search("").len(), 3);
        assert!(store.search("inventory").is_empty());
    }

    #[test]
    fn test_sync_ignores_stale_message_lists() {
        let mut store = ConversationsStore::new();
        let mut list = MessageList::new();
        list.push(Message::user("u".into(), "Question"));
        let stale = list.clone();

        list.push(Message::pending_assistant("a".into()));
        assert!(store.sync_messages("1", &list));
        assert_eq!(store.get("1").unwrap().message_count(), 2);

        assert!(!store.sync_messages("1", &stale));
        assert_eq!(store.get("1").unwrap().message_count(), 2);
        assert!(!store.sync_messages("1", &list));
    }

    #[test]
    fn test_save_replaces_everything() {
        let mut store = store_with(&["A", "B"]);
        let replacement = vec![Conversation::new("Z".into(), Vec::new())];
        store.save(replacement);
        assert_eq!(ids(&store), vec!["Z"]);
    }

    #[tokio::test]
    async fn test_mutations_reach_the_repository() {
        let repo = InMemoryConversationRepository::new();
        let mut store = ConversationsStore::load(Arc::new(repo.clone())).await.unwrap();
        assert_eq!(store.count(), 0);

        store.upsert_from_messages("1", &[Message::user("a".into(), "one")]);
        store.upsert_from_messages("2", &[Message::user("b".into(), "two")]);
        store.set_pinned("1", true);
        store.flush().await.unwrap();

        let persisted = repo.snapshot();
        let persisted_ids: Vec<&str> = persisted.iter().map(|c| c.id()).collect();
        assert_eq!(persisted_ids, vec!["1", "2"]);
        assert!(persisted[0].is_pinned());

        let reloaded = ConversationsStore::load(Arc::new(repo.clone())).await.unwrap();
        assert_eq!(ids(&reloaded), vec!["1", "2"]);
    }
}
