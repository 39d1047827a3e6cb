use std::future::Future;
use std::pin::Pin;

use super::error::RepositoryResult;
use crate::models::Conversation;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Repository trait for conversation persistence.
///
/// The list is always written whole: `save_all` replaces whatever was stored
/// before, and `load_all` returns conversations in the order they were saved.
pub trait ConversationRepository: Send + Sync + 'static {
    /// Load all conversations, or an empty list on first run.
    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>>;

    /// Replace the stored list with `conversations`.
    fn save_all(&self, conversations: Vec<Conversation>) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Human-readable location, for logs.
    fn storage_path(&self) -> String;
}
