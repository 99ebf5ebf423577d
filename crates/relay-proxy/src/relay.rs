use chrono::Utc;
use relay_config::ProxySettings;
use relay_core::context::window;
use relay_core::{
    trim_message, ChatMessage, ChatRequest, ChatSuccess, ErrorKind, MessageRole, RelayError, Result,
    TokenUsage,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::upstream::{CompletionApi, CompletionRequest, CompletionResponse, UpstreamErrorBody, UpstreamReply};

const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded. Please try again later.";
const UNAUTHORIZED_MESSAGE: &str = "Upstream authentication failed. Please check server configuration.";
const REJECTED_MESSAGE: &str = "Invalid request format.";
const MALFORMED_MESSAGE: &str = "Invalid response format from AI service";

/// Validates a chat turn, forwards it with its windowed history and
/// normalizes whatever comes back.
pub struct RelayProxy {
    api: Arc<dyn CompletionApi>,
    settings: ProxySettings,
}

impl RelayProxy {
    pub fn new(api: Arc<dyn CompletionApi>, settings: ProxySettings) -> Self {
        Self { api, settings }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    #[instrument(skip(self, request), fields(history = request.conversation.len()))]
    pub async fn relay(&self, request: ChatRequest) -> Result<ChatSuccess> {
        let message = self.validate(&request)?;
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.settings.default_model)
            .to_string();

        let messages = self.compose_messages(&request.conversation, message);
        let completion = CompletionRequest::new(model.clone(), messages, &self.settings.sampling);

        let started = Instant::now();
        let reply = self.api.complete(&completion).await?;
        let elapsed_ms = started.elapsed().as_millis();

        if !reply.is_success() {
            let err = normalize_failure(&reply);
            warn!(
                "Upstream returned HTTP {} after {}ms ({:?})",
                reply.status,
                elapsed_ms,
                err.kind()
            );
            return Err(err);
        }

        let success = normalize_success(&reply.body, &model)?;
        info!(
            "Relayed completion {} for model {} in {}ms ({} tokens)",
            success.id, model, elapsed_ms, success.usage.total_tokens
        );
        Ok(success)
    }

    /// Returns the trimmed message, or why it cannot be relayed.
    fn validate<'a>(&self, request: &'a ChatRequest) -> Result<&'a str> {
        let trimmed = trim_message(&request.message);
        if trimmed.is_empty() {
            return Err(RelayError::InvalidRequest(
                "Message is required and must be a non-empty string".into(),
            ));
        }
        if request.message.chars().count() > self.settings.max_message_length {
            return Err(RelayError::InvalidRequest(format!(
                "Message is too long. Maximum {} characters.",
                self.settings.max_message_length
            )));
        }
        Ok(trimmed)
    }

    /// `[system preamble, ...windowed history, new user turn]`
    fn compose_messages(&self, conversation: &[ChatMessage], message: &str) -> Vec<ChatMessage> {
        let history: Vec<ChatMessage> = conversation
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .cloned()
            .collect();
        if history.len() != conversation.len() {
            debug!(
                "Dropped {} caller-supplied system messages",
                conversation.len() - history.len()
            );
        }

        let recent = window(&history, self.settings.history_window);
        let mut messages = Vec::with_capacity(recent.len() + 2);
        messages.push(ChatMessage::system(self.settings.system_prompt.clone()));
        messages.extend_from_slice(recent);
        messages.push(ChatMessage::user(message));
        messages
    }
}

fn normalize_failure(reply: &UpstreamReply) -> RelayError {
    let status = reply.status;
    let kind = ErrorKind::from_upstream_status(status);

    let message = match serde_json::from_str::<UpstreamErrorBody>(&reply.body) {
        Err(_) => format!("HTTP {}", status),
        Ok(body) => match kind {
            ErrorKind::RateLimited => RATE_LIMITED_MESSAGE.to_string(),
            ErrorKind::Unauthorized => UNAUTHORIZED_MESSAGE.to_string(),
            ErrorKind::UpstreamRejectedRequest => REJECTED_MESSAGE.to_string(),
            _ => body
                .error
                .and_then(|e| e.message)
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| format!("HTTP {}", status)),
        },
    };

    RelayError::from_parts(kind, message, Some(status))
}

fn normalize_success(body: &str, model: &str) -> Result<ChatSuccess> {
    let parsed: CompletionResponse = serde_json::from_str(body).map_err(|e| {
        RelayError::MalformedUpstreamResponse(format!("{}: {}", MALFORMED_MESSAGE, e))
    })?;

    let text = parsed
        .choices
        .first()
        .and_then(|choice| choice.message.as_ref())
        .and_then(|message| message.content.as_deref())
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| {
            RelayError::MalformedUpstreamResponse(format!(
                "{}: no completion text in response",
                MALFORMED_MESSAGE
            ))
        })?;

    let usage = parsed
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens.unwrap_or(0),
            completion_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens.unwrap_or(0),
        })
        .unwrap_or_default();

    let id = parsed
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("chat_{}", Utc::now().timestamp_millis()));

    Ok(ChatSuccess::new(text, usage, model, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::MockCompletionApi;
    use serde_json::json;

    fn settings() -> ProxySettings {
        ProxySettings {
            default_model: "default-model".into(),
            system_prompt: "be helpful".into(),
            history_window: 4,
            max_message_length: 50,
            ..ProxySettings::default()
        }
    }

    fn proxy(mock: MockCompletionApi) -> RelayProxy {
        RelayProxy::new(Arc::new(mock), settings())
    }

    fn completion_body(text: &str) -> String {
        json!({
            "id": "cmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": text } }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 }
        })
        .to_string()
    }

    fn replying(status: u16, body: impl Into<String>) -> MockCompletionApi {
        let body = body.into();
        let mut mock = MockCompletionApi::new();
        mock.expect_complete()
            .times(1)
            .returning(move |_| Ok(UpstreamReply::new(status, body.clone())));
        mock
    }

    #[tokio::test]
    async fn test_success_is_normalized() {
        let relay = proxy(replying(200, completion_body("Hi there")));
        let success = relay.relay(ChatRequest::new("Hello")).await.unwrap();

        assert!(success.success);
        assert_eq!(success.response, "Hi there");
        assert_eq!(success.usage.prompt_tokens, 5);
        assert_eq!(success.usage.completion_tokens, 3);
        assert_eq!(success.usage.total_tokens, 8);
        assert_eq!(success.model, "default-model");
        assert_eq!(success.id, "cmpl-1");
    }

    #[tokio::test]
    async fn test_messages_are_composed_in_order() {
        let mut mock = MockCompletionApi::new();
        mock.expect_complete()
            .withf(|request| {
                let roles: Vec<MessageRole> = request.messages.iter().map(|m| m.role).collect();
                let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
                request.model == "picked-model"
                    && !request.stream
                    && roles
                        == vec![
                            MessageRole::System,
                            MessageRole::User,
                            MessageRole::Assistant,
                            MessageRole::User,
                            MessageRole::Assistant,
                            MessageRole::User,
                        ]
                    && contents == vec!["be helpful", "u2", "a2", "u3", "a3", "new turn"]
            })
            .times(1)
            .returning(|_| Ok(UpstreamReply::new(200, completion_body("ok"))));

        let history = vec![
            ChatMessage::user("u1"),
            ChatMessage::assistant("a1"),
            ChatMessage::system("injected"),
            ChatMessage::user("u2"),
            ChatMessage::assistant("a2"),
            ChatMessage::user("u3"),
            ChatMessage::assistant("a3"),
        ];
        let request = ChatRequest::new("  new turn  ")
            .with_model("picked-model")
            .with_conversation(history);

        let success = proxy(mock).relay(request).await.unwrap();
        assert_eq!(success.model, "picked-model");
    }

    #[tokio::test]
    async fn test_invalid_messages_never_reach_upstream() {
        let too_long = "x".repeat(51);
        for message in ["", "   ", "\n\t", "\u{feff}", " \u{feff}\n", too_long.as_str()] {
            let mut mock = MockCompletionApi::new();
            mock.expect_complete().times(0);

            let err = proxy(mock).relay(ChatRequest::new(message)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest, "message {:?}", message);
        }
    }

    #[tokio::test]
    async fn test_length_bound_is_inclusive_and_counts_chars() {
        let relay = proxy(replying(200, completion_body("ok")));
        assert!(relay.relay(ChatRequest::new("é".repeat(50))).await.is_ok());
    }

    #[tokio::test]
    async fn test_upstream_status_taxonomy() {
        let cases = [
            (429, ErrorKind::RateLimited, RATE_LIMITED_MESSAGE.to_string()),
            (401, ErrorKind::Unauthorized, UNAUTHORIZED_MESSAGE.to_string()),
            (400, ErrorKind::UpstreamRejectedRequest, REJECTED_MESSAGE.to_string()),
            (503, ErrorKind::UpstreamError, "model overloaded".to_string()),
        ];

        for (status, kind, message) in cases {
            let body = json!({ "error": { "message": "model overloaded" } }).to_string();
            let err = proxy(replying(status, body))
                .relay(ChatRequest::new("Hello"))
                .await
                .unwrap_err();

            assert_eq!(err.kind(), kind);
            assert_eq!(err.upstream_status(), Some(status));
            assert_eq!(err.to_string(), message);
        }
    }

    #[tokio::test]
    async fn test_unparseable_error_body_falls_back_to_status() {
        for status in [429, 502] {
            let err = proxy(replying(status, "<html>Bad Gateway</html>"))
                .relay(ChatRequest::new("Hello"))
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), format!("HTTP {}", status));
            assert_eq!(err.kind(), ErrorKind::from_upstream_status(status));
        }
    }

    #[tokio::test]
    async fn test_unauthorized_never_leaks_upstream_text() {
        let body = json!({ "error": { "message": "Invalid API Key gsk_abc" } }).to_string();
        let err = proxy(replying(401, body))
            .relay(ChatRequest::new("Hello"))
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("gsk_abc"));
    }

    #[tokio::test]
    async fn test_malformed_success_bodies() {
        let bodies = [
            "not json".to_string(),
            json!({ "choices": [] }).to_string(),
            json!({ "choices": [{ "message": { "content": "   " } }] }).to_string(),
            json!({ "choices": [{ "finish_reason": "stop" }] }).to_string(),
        ];

        for body in bodies {
            let err = proxy(replying(200, body.clone()))
                .relay(ChatRequest::new("Hello"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedUpstreamResponse, "body {}", body);
        }
    }

    #[tokio::test]
    async fn test_missing_usage_and_id_get_defaults() {
        let body = json!({ "choices": [{ "message": { "content": "hey" } }], "usage": { "total_tokens": 2 } })
            .to_string();
        let success = proxy(replying(200, body))
            .relay(ChatRequest::new("Hello"))
            .await
            .unwrap();

        assert_eq!(success.usage.prompt_tokens, 0);
        assert_eq!(success.usage.completion_tokens, 0);
        assert_eq!(success.usage.total_tokens, 2);
        assert!(success.id.starts_with("chat_"));
    }

    #[tokio::test]
    async fn test_non_integer_usage_still_succeeds() {
        let body = json!({
            "choices": [{ "message": { "content": "Hi there" } }],
            "usage": { "prompt_tokens": 5.0, "completion_tokens": "x", "total_tokens": 8 }
        })
        .to_string();
        let success = proxy(replying(200, body))
            .relay(ChatRequest::new("Hello"))
            .await
            .unwrap();

        assert_eq!(success.response, "Hi there");
        assert_eq!(success.usage.prompt_tokens, 5);
        assert_eq!(success.usage.completion_tokens, 0);
        assert_eq!(success.usage.total_tokens, 8);
    }

    #[tokio::test]
    async fn test_byte_order_mark_is_trimmed_before_upstream() {
        let mut mock = MockCompletionApi::new();
        mock.expect_complete()
            .withf(|request| request.messages.last().map(|m| m.content.as_str()) == Some("Hello"))
            .times(1)
            .returning(|_| Ok(UpstreamReply::new(200, completion_body("ok"))));

        assert!(proxy(mock).relay(ChatRequest::new("\u{feff}Hello ")).await.is_ok());
    }

    #[tokio::test]
    async fn test_transport_failure_is_passed_through() {
        let mut mock = MockCompletionApi::new();
        mock.expect_complete()
            .times(1)
            .returning(|_| Err(RelayError::TransportError("connection refused".into())));

        let err = proxy(mock).relay(ChatRequest::new("Hello")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
    }
}
