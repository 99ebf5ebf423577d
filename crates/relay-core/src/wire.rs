//! JSON contract between the relay client and the relay proxy.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, RelayError};
use crate::{ChatMessage, TokenUsage};

/// Body of `POST /chat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_conversation(mut self, conversation: Vec<ChatMessage>) -> Self {
        self.conversation = conversation;
        self
    }
}

/// Trims whitespace and byte order marks from both ends of a chat message.
pub fn trim_message(text: &str) -> &str {
    text.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSuccess {
    pub success: bool,
    pub response: String,
    #[serde(default)]
    pub usage: TokenUsage,
    pub model: String,
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatSuccess {
    pub fn new(
        response: impl Into<String>,
        usage: TokenUsage,
        model: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            response: response.into(),
            usage,
            model: model.into(),
            id: id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFailure {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ChatFailure {
    /// Converts a proxy failure body back into a typed error.
    pub fn into_error(self, http_status: u16) -> RelayError {
        let kind = self
            .kind
            .unwrap_or_else(|| ErrorKind::infer(http_status, self.status));
        RelayError::from_parts(kind, self.error, self.status)
    }
}

impl From<&RelayError> for ChatFailure {
    fn from(err: &RelayError) -> Self {
        let error = match err.kind() {
            // Internal details stay in the server log.
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => err.to_string(),
        };
        Self {
            success: false,
            error,
            status: err.upstream_status(),
            kind: Some(err.kind()),
        }
    }
}

/// Either shape the proxy answers `POST /chat` with, told apart by `success`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RelayResponse {
    Success(ChatSuccess),
    Failure(ChatFailure),
}

impl<'de> Deserialize<'de> for RelayResponse {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value.get("success").and_then(Value::as_bool) {
            Some(true) => serde_json::from_value(value)
                .map(RelayResponse::Success)
                .map_err(de::Error::custom),
            Some(false) => serde_json::from_value(value)
                .map(RelayResponse::Failure)
                .map_err(de::Error::custom),
            None => Err(de::Error::custom("missing boolean `success` field")),
        }
    }
}

/// Body of the health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn online(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            status: "online".to_string(),
            service: service.into(),
            version: version.into(),
            timestamp: Utc::now(),
        }
    }
}
