use relay_config::RelayConfig;
use relay_conversation::{ConversationId, ConversationStore};
use relay_core::context::window;
use relay_core::{trim_message, ChatMessage, ChatSuccess, ErrorKind, Result, TokenUsage};
use relay_metrics::{MetricsCollector, MetricsSummary, ModelTokenStats, TokenTracker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::client::RelayClient;
use crate::transport::HttpTransport;

/// Ties the relay client to the conversation store: what a chat UI drives.
pub struct ChatSession {
    client: RelayClient,
    store: AsyncMutex<ConversationStore>,
    history_window: usize,
    tokens: TokenTracker,
    metrics: Mutex<MetricsCollector>,
}

impl ChatSession {
    /// Starts a session, creating the first conversation when none is active.
    pub fn start(client: RelayClient, mut store: ConversationStore, history_window: usize) -> Self {
        if store.active_id().is_none() {
            let id = store.create_conversation();
            debug!("Started session with new conversation {}", id);
        }

        Self {
            client,
            store: AsyncMutex::new(store),
            history_window,
            tokens: TokenTracker::new(),
            metrics: Mutex::new(MetricsCollector::new()),
        }
    }

    /// HTTP client and file-backed store as configured.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.client)?;
        let client = RelayClient::new(Arc::new(transport), config.client.model.clone());
        let store = ConversationStore::from_settings(&config.store);
        Ok(Self::start(client, store, config.client.history_window))
    }

    /// Sends `text` in the active conversation and records the exchange.
    ///
    /// Nothing is stored unless the relay succeeds. If the conversation is
    /// cleared while the request is pending, the reply is dropped and
    /// `UnknownConversation` is returned.
    pub async fn send(&self, text: &str) -> Result<ChatSuccess> {
        let text = trim_message(text);
        let (conversation_id, history) = self.snapshot().await?;

        let reply = match self.client.send(text, &history).await {
            Ok(reply) => reply,
            Err(err) => {
                if err.kind() != ErrorKind::AlreadyInFlight {
                    let elapsed = self.client.last_latency().unwrap_or_default();
                    self.metrics().record_failure(elapsed, err.kind());
                }
                warn!("Send in conversation {} failed: {}", conversation_id, err);
                return Err(err);
            }
        };

        {
            let mut store = self.store.lock().await;
            store.set_title_from_first_message(&conversation_id, text)?;
            store.append_turn(&conversation_id, text, reply.payload.response.clone())?;
        }

        self.tokens.record(&reply.payload.usage, &reply.payload.model);
        self.metrics().record_success(reply.elapsed);
        info!(
            "Reply in conversation {} after {}ms",
            conversation_id,
            reply.elapsed.as_millis()
        );
        Ok(reply.payload)
    }

    /// Active conversation id plus the windowed history to send with it.
    async fn snapshot(&self) -> Result<(ConversationId, Vec<ChatMessage>)> {
        let mut store = self.store.lock().await;
        let conversation_id = match store.active_id() {
            Some(id) => id.to_string(),
            None => store.create_conversation(),
        };
        let history = window(store.messages(&conversation_id)?, self.history_window)
            .iter()
            .map(ChatMessage::from)
            .collect();
        Ok((conversation_id, history))
    }

    pub async fn store(&self) -> MutexGuard<'_, ConversationStore> {
        self.store.lock().await
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.tokens.get_stats()
    }

    pub fn model_usage(&self) -> HashMap<String, ModelTokenStats> {
        self.tokens.get_model_stats()
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics().get_summary()
    }

    fn metrics(&self) -> std::sync::MutexGuard<'_, MetricsCollector> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
