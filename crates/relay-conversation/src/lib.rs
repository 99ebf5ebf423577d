pub mod metadata;
pub mod storage;
pub mod store;

pub use metadata::{Conversation, ConversationId, ConversationSummary, SessionState};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, SessionRepository};
pub use store::ConversationStore;
