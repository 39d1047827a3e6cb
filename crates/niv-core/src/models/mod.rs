pub mod conversation;
pub mod conversations_store;
pub mod ids;
pub mod message;
pub mod message_assembler;
pub mod session;

pub use conversation::{Conversation, DEFAULT_TITLE, TITLE_MAX_CHARS, derive_title};
pub use conversations_store::ConversationsStore;
pub use ids::{IdGenerator, next_id, next_message_pair};
pub use message::{Message, MessageList, Role};
pub use message_assembler::{
    EMPTY_RESPONSE_PLACEHOLDER, ERROR_MARKER, MessageAssembler, SendRejection, StreamStatus,
};
pub use session::SessionContext;
