use async_trait::async_trait;
use relay_config::ClientSettings;
use relay_core::{ChatRequest, RelayError, RelayResponse, Result};
use tracing::debug;

/// What the proxy answered, together with the HTTP status it used.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyReply {
    pub status: u16,
    pub response: RelayResponse,
}

/// One HTTP exchange with the relay proxy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Posts the request. Errors only when no well-formed proxy body came back.
    async fn post_chat(&self, request: &ChatRequest) -> Result<ProxyReply>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        if !settings.endpoint.starts_with("http://") && !settings.endpoint.starts_with("https://") {
            return Err(RelayError::ConfigError(
                "Relay endpoint must start with http:// or https://".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ProxyTransport for HttpTransport {
    async fn post_chat(&self, request: &ChatRequest) -> Result<ProxyReply> {
        debug!(
            "Posting message to {} with {} history entries",
            self.endpoint,
            request.conversation.len()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| RelayError::TransportError(format!("Failed to reach relay proxy: {}", e)))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            RelayError::TransportError(format!("Failed to read relay proxy response: {}", e))
        })?;

        let response = serde_json::from_str::<RelayResponse>(&body).map_err(|_| {
            RelayError::TransportError(format!(
                "Unexpected response from relay proxy (HTTP {})",
                status
            ))
        })?;

        Ok(ProxyReply { status, response })
    }
}
