use relay_core::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

pub mod env_substitution;

pub use env_substitution::substitute_env_vars;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

/// Server-side relay settings. Holds the only reference to upstream credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Name of the environment variable holding the upstream API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_proxy_window")]
    pub history_window: usize,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub sampling: SamplingSettings,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_service_version")]
    pub service_version: String,
}

/// Fixed sampling parameters sent with every upstream completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub presence_penalty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_client_window")]
    pub history_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_store_key")]
    pub key: String,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

/// Upstream credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(****)")
    }
}

impl RelayConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RelayError::ConfigError(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut raw: serde_json::Value = if yaml.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_yaml::from_str(yaml)
                .map_err(|e| RelayError::ConfigError(format!("Failed to parse YAML: {}", e)))?
        };
        if raw.is_null() {
            raw = serde_json::Value::Object(Default::default());
        }

        substitute_env_vars(&mut raw)?;

        let config: RelayConfig = serde_json::from_value(raw)
            .map_err(|e| RelayError::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Loads the file at `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_yaml(path)
        } else {
            tracing::debug!("No config file at {:?}, using defaults", path);
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let proxy = &self.proxy;
        if proxy.upstream_url.is_empty() {
            return Err(RelayError::ConfigError("Upstream URL cannot be empty".into()));
        }
        if proxy.api_key_env.is_empty() {
            return Err(RelayError::ConfigError("api_key_env cannot be empty".into()));
        }
        if proxy.default_model.is_empty() {
            return Err(RelayError::ConfigError("Default model cannot be empty".into()));
        }
        if proxy.history_window == 0 || self.client.history_window == 0 {
            return Err(RelayError::ConfigError("History window must be at least 1".into()));
        }
        if proxy.max_message_length == 0 {
            return Err(RelayError::ConfigError("Maximum message length must be at least 1".into()));
        }
        if !(0.0..=2.0).contains(&proxy.sampling.temperature) {
            return Err(RelayError::ConfigError("Temperature must be between 0.0 and 2.0".into()));
        }
        if proxy.sampling.top_p <= 0.0 || proxy.sampling.top_p > 1.0 {
            return Err(RelayError::ConfigError("top_p must be in (0.0, 1.0]".into()));
        }
        if self.client.endpoint.is_empty() {
            return Err(RelayError::ConfigError("Client endpoint cannot be empty".into()));
        }
        if self.client.model.as_deref() == Some("") {
            return Err(RelayError::ConfigError("Client model cannot be empty".into()));
        }
        if self.store.key.is_empty() {
            return Err(RelayError::ConfigError("Store key cannot be empty".into()));
        }
        if self.store.title_max_chars == 0 {
            return Err(RelayError::ConfigError("Title length must be at least 1".into()));
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        relay_home().join("relay.yaml")
    }
}

impl ProxySettings {
    /// Reads the upstream credential from the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<ApiKey> {
        match env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(ApiKey::new(key.trim())),
            _ => Err(RelayError::ConfigError(format!(
                "Upstream API key not found: set the {} environment variable",
                self.api_key_env
            ))),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upstream_url: default_upstream_url(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            system_prompt: default_system_prompt(),
            history_window: default_proxy_window(),
            max_message_length: default_max_message_length(),
            user_agent: default_user_agent(),
            sampling: SamplingSettings::default(),
            service_name: default_service_name(),
            service_version: default_service_version(),
        }
    }
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: None,
            history_window: default_client_window(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            key: default_store_key(),
            title_max_chars: default_title_max_chars(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:8787".to_string() }
fn default_upstream_url() -> String { "https://api.groq.com/openai/v1/chat/completions".to_string() }
fn default_api_key_env() -> String { "GROQ_API_KEY".to_string() }
fn default_model() -> String { "llama-3.1-8b-instant".to_string() }
fn default_proxy_window() -> usize { 10 }
fn default_max_message_length() -> usize { 5000 }
fn default_user_agent() -> String { format!("relay-chat/{}", env!("CARGO_PKG_VERSION")) }
fn default_service_name() -> String { "relay-chat proxy".to_string() }
fn default_service_version() -> String { env!("CARGO_PKG_VERSION").to_string() }
fn default_temperature() -> f64 { 0.7 }
fn default_max_tokens() -> u32 { 1024 }
fn default_top_p() -> f64 { 1.0 }
fn default_endpoint() -> String { "http://127.0.0.1:8787/chat".to_string() }
fn default_client_window() -> usize { 6 }
fn default_store_key() -> String { "relay-chat.session".to_string() }
fn default_title_max_chars() -> usize { 30 }

fn default_system_prompt() -> String {
    "You are a helpful and knowledgeable AI assistant. \
     Provide accurate, detailed and thoughtful responses. \
     Use markdown formatting when appropriate and fenced code blocks with a language tag for code. \
     Be concise but thorough."
        .to_string()
}

fn default_store_dir() -> PathBuf {
    relay_home()
}

/// `$RELAY_HOME`, falling back to `~/.relay-chat`.
pub fn relay_home() -> PathBuf {
    env::var("RELAY_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|p| p.join(".relay-chat"))
                .unwrap_or_else(|| PathBuf::from("./.relay-chat"))
        })
}
