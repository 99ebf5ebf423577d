use chrono::{DateTime, Utc};
use relay_core::{Message, MessageRole};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ConversationId = String;

pub const DEFAULT_TITLE: &str = "New Chat";

/// Current layout of the persisted session blob.
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// One conversation thread and its append-only message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Appends a user/assistant pair as one update.
    pub(crate) fn push_turn(&mut self, user: Message, assistant: Message) {
        self.messages.push(user);
        self.messages.push(assistant);
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        // Never move backwards, even if the wall clock does.
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Checks the invariants a restored conversation must satisfy.
    pub(crate) fn is_consistent(&self) -> bool {
        !self.id.is_empty()
            && self.updated_at >= self.created_at
            && self.messages.iter().all(|m| m.role != MessageRole::System)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Listing entry for a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            title: conversation.title.clone(),
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            message_count: conversation.message_count(),
        }
    }
}

/// Everything that survives a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub active: Option<ConversationId>,
}

impl SessionState {
    pub fn empty() -> Self {
        Self {
            version: SESSION_FORMAT_VERSION,
            conversations: Vec::new(),
            active: None,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Most recently updated conversation, if any.
    pub fn latest(&self) -> Option<&Conversation> {
        self.conversations.iter().max_by_key(|c| c.updated_at)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::empty()
    }
}

fn current_version() -> u32 {
    SESSION_FORMAT_VERSION
}
