use relay_config::StoreSettings;
use relay_core::{Message, RelayError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metadata::{Conversation, ConversationId, ConversationSummary, SessionState};
use crate::storage::{FileStorage, KeyValueStorage, SessionRepository};

/// Owns every conversation, the active pointer and their persistence.
pub struct ConversationStore {
    repository: SessionRepository,
    state: SessionState,
    title_max_chars: usize,
}

impl ConversationStore {
    /// Opens the store, restoring whatever the repository holds.
    pub fn open(repository: SessionRepository, title_max_chars: usize) -> Self {
        let state = repository.load();
        info!(
            "Opened conversation store with {} conversations",
            state.conversations.len()
        );
        Self {
            repository,
            state,
            title_max_chars,
        }
    }

    /// File-backed store as described by the store settings.
    pub fn from_settings(settings: &StoreSettings) -> Self {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(FileStorage::new(&settings.dir));
        let repository = SessionRepository::new(storage, settings.key.clone());
        Self::open(repository, settings.title_max_chars)
    }

    /// Creates an empty conversation and makes it active.
    pub fn create_conversation(&mut self) -> ConversationId {
        let conversation = Conversation::new();
        let id = conversation.id.clone();
        self.state.conversations.push(conversation);
        self.state.active = Some(id.clone());
        self.persist();

        info!("Created conversation {}", id);
        id
    }

    /// Records a user turn and its reply together.
    pub fn append_turn(
        &mut self,
        conversation_id: &str,
        user_message: impl Into<String>,
        assistant_message: impl Into<String>,
    ) -> Result<()> {
        let conversation = self
            .state
            .get_mut(conversation_id)
            .ok_or_else(|| RelayError::UnknownConversation(conversation_id.to_string()))?;

        conversation.push_turn(
            Message::user(user_message),
            Message::assistant(assistant_message),
        );
        debug!(
            "Appended turn to conversation {} ({} messages)",
            conversation_id,
            conversation.message_count()
        );
        self.persist();
        Ok(())
    }

    /// Titles a conversation after its first message. Does nothing once it has messages.
    pub fn set_title_from_first_message(&mut self, conversation_id: &str, text: &str) -> Result<()> {
        let max_chars = self.title_max_chars;
        let conversation = self
            .state
            .get_mut(conversation_id)
            .ok_or_else(|| RelayError::UnknownConversation(conversation_id.to_string()))?;

        if conversation.message_count() > 0 {
            return Ok(());
        }

        let title = display_title(text, max_chars);
        if title.is_empty() || title == conversation.title {
            return Ok(());
        }
        conversation.title = title;
        conversation.touch();
        self.persist();
        Ok(())
    }

    /// Switches the active conversation.
    pub fn select(&mut self, conversation_id: &str) -> Result<()> {
        if !self.state.contains(conversation_id) {
            return Err(RelayError::UnknownConversation(conversation_id.to_string()));
        }
        self.state.active = Some(conversation_id.to_string());
        self.persist();
        Ok(())
    }

    /// Removes one conversation and its log for good.
    pub fn clear(&mut self, conversation_id: &str) -> Result<()> {
        let before = self.state.conversations.len();
        self.state.conversations.retain(|c| c.id != conversation_id);
        if self.state.conversations.len() == before {
            return Err(RelayError::UnknownConversation(conversation_id.to_string()));
        }

        if self.state.active.as_deref() == Some(conversation_id) {
            self.state.active = self.state.latest().map(|c| c.id.clone());
        }
        self.persist();

        info!("Cleared conversation {}", conversation_id);
        Ok(())
    }

    /// Removes every conversation and resets the active pointer.
    pub fn clear_all(&mut self) {
        let count = self.state.conversations.len();
        self.state.conversations.clear();
        self.state.active = None;
        if let Err(e) = self.repository.discard() {
            warn!("Failed to discard saved session: {}", e);
        }

        info!("Cleared all {} conversations", count);
    }

    pub fn active_id(&self) -> Option<&str> {
        self.state.active.as_deref()
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.state.active.as_deref().and_then(|id| self.state.get(id))
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.state.get(conversation_id)
    }

    pub fn messages(&self, conversation_id: &str) -> Result<&[Message]> {
        self.state
            .get(conversation_id)
            .map(Conversation::messages)
            .ok_or_else(|| RelayError::UnknownConversation(conversation_id.to_string()))
    }

    /// Summaries, most recently updated first.
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .state
            .conversations
            .iter()
            .map(ConversationSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Writes the current state, reporting failures to the caller.
    pub fn save(&self) -> Result<()> {
        self.repository.save(&self.state)
    }

    /// Replaces the in-memory state with what storage holds.
    pub fn reload(&mut self) {
        self.state = self.repository.load();
    }

    fn persist(&self) {
        if let Err(e) = self.repository.save(&self.state) {
            warn!("Failed to persist conversation store: {}", e);
        }
    }
}

const ELLIPSIS: &str = "...";

/// Collapses whitespace and bounds the title to `max_chars` characters, ellipsis included.
fn display_title(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    if max_chars <= ELLIPSIS.len() {
        return collapsed.chars().take(max_chars).collect();
    }
    let truncated: String = collapsed.chars().take(max_chars - ELLIPSIS.len()).collect();
    format!("{}{}", truncated.trim_end(), ELLIPSIS)
}
