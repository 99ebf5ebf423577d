use async_trait::async_trait;
use relay_config::{ApiKey, ProxySettings, SamplingSettings};
use relay_core::{ChatMessage, RelayError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

/// Non-streaming chat-completion request in the OpenAI-compatible format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, sampling: &SamplingSettings) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: sampling.top_p,
            frequency_penalty: sampling.frequency_penalty,
            presence_penalty: sampling.presence_penalty,
            stream: false,
        }
    }
}

/// Raw upstream answer. Interpreting it is the relay's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: String,
}

impl UpstreamReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionResponse {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default, deserialize_with = "lenient_usage")]
    pub usage: Option<UsageCounters>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: Option<ChoiceMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// Token counters. Values that are not non-negative numbers read as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageCounters {
    #[serde(default, deserialize_with = "lenient_count")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub completion_tokens: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_tokens: Option<u64>,
}

fn lenient_count<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| {
        v.as_u64().or_else(|| {
            v.as_f64()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .map(|n| n as u64)
        })
    }))
}

fn lenient_usage<'de, D>(deserializer: D) -> std::result::Result<Option<UsageCounters>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_str().map(str::to_string)))
}

/// `{"error": {"message": ...}}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(default)]
    pub error: Option<UpstreamErrorDetail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
}

/// The hosted completion API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionApi: Send + Sync {
    /// Issues exactly one request. Only failures to get any HTTP answer are errors.
    async fn complete(&self, request: &CompletionRequest) -> Result<UpstreamReply>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
    api_key: ApiKey,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("url", &self.url)
            .finish()
    }
}

impl HttpUpstream {
    pub fn new(settings: &ProxySettings, api_key: ApiKey) -> Result<Self> {
        if !settings.upstream_url.starts_with("http://") && !settings.upstream_url.starts_with("https://") {
            return Err(RelayError::ConfigError(
                "Upstream URL must start with http:// or https://".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: settings.upstream_url.clone(),
            api_key,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn redact(&self, body: String) -> String {
        let key = self.api_key.expose();
        if key.is_empty() || !body.contains(key) {
            body
        } else {
            body.replace(key, "[redacted]")
        }
    }
}

#[async_trait]
impl CompletionApi for HttpUpstream {
    async fn complete(&self, request: &CompletionRequest) -> Result<UpstreamReply> {
        debug!(
            "Calling upstream {} with model {} and {} messages",
            self.url,
            request.model,
            request.messages.len()
        );

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                RelayError::TransportError(format!(
                    "Failed to reach upstream completion service: {}",
                    e.without_url()
                ))
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            RelayError::TransportError(format!(
                "Failed to read upstream response: {}",
                e.without_url()
            ))
        })?;

        let body = if (200..300).contains(&status) {
            body
        } else {
            self.redact(body)
        };
        Ok(UpstreamReply { status, body })
    }
}
