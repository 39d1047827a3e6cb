pub mod conversation_json_repository;
pub mod conversation_repository;
pub mod error;
pub mod in_memory_repository;

pub use conversation_json_repository::ConversationJsonRepository;
pub use conversation_repository::{BoxFuture, ConversationRepository};
pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::InMemoryConversationRepository;
