use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProjectId(pub String);

impl From<String> for ProjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum SitesmithError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("All providers failed ({attempts} attempted)")]
    ChainExhausted { attempts: usize },

    #[error("Sandbox could not be created: {0}")]
    SandboxProvision(String),

    #[error("Failed to write {path} into the sandbox: {message}")]
    FileWrite { path: String, message: String },

    #[error("Preview server failed to start: {0}")]
    ServerStart(String),

    #[error("Failed to save the result: {0}")]
    Persistence(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl SitesmithError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into(), SpanTrace::capture())
    }

    /// Message shown to the caller in an `error` event.
    pub fn user_message(&self) -> String {
        match self {
            Self::ChainExhausted { .. } => {
                "All providers failed. Check your API keys and try again.".to_string()
            }
            Self::Database(_) | Self::Persistence(_) => {
                "The site was generated but could not be saved. Please retry.".to_string()
            }
            Self::Internal(m, _) => m.clone(),
            other => other.to_string(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            SitesmithError::InvalidRequest(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_REQUEST",
            ),
            SitesmithError::Provider { .. } | SitesmithError::ChainExhausted { .. } => (
                axum::http::StatusCode::BAD_GATEWAY,
                self.inner.to_string(),
                "UPSTREAM_ERROR",
            ),
            SitesmithError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            SitesmithError::SandboxProvision(m) | SitesmithError::ServerStart(m) => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                m.clone(),
                "SANDBOX_ERROR",
            ),
            SitesmithError::FileWrite { .. } => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                self.inner.to_string(),
                "SANDBOX_ERROR",
            ),
            SitesmithError::Database(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            SitesmithError::Persistence(m) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "PERSISTENCE_ERROR",
            ),
            SitesmithError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            SitesmithError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            SitesmithError::ClientDisconnected => (
                axum::http::StatusCode::BAD_REQUEST,
                "client disconnected".to_string(),
                "CLIENT_DISCONNECTED",
            ),
            SitesmithError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: SitesmithError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<SitesmithError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- REQUEST ---

/// One accepted generation request. Field names follow the web client's camelCase body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub project_id: ProjectId,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub partial_code: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

const MAX_PROMPT_CHARS: usize = 32_000;
const MAX_PARTIAL_CODE_CHARS: usize = 2_000_000;

impl GenerationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.project_id.0.trim().is_empty() {
            return Err(SitesmithError::InvalidRequest("projectId is required".into()).into());
        }

        if !self.provider.is_empty() && crate::providers::ProviderKind::parse(&self.provider).is_none() {
            return Err(SitesmithError::InvalidRequest(format!(
                "Unknown provider '{}'",
                self.provider
            ))
            .into());
        }

        if let Some(base_url) = self.base_url.as_deref().filter(|u| !u.is_empty()) {
            if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
                return Err(SitesmithError::InvalidRequest(
                    "baseUrl must be an http(s) URL".into(),
                )
                .into());
            }
        }

        if let Some(prompt) = &self.prompt {
            if prompt.chars().count() > MAX_PROMPT_CHARS {
                return Err(SitesmithError::InvalidRequest(format!(
                    "prompt exceeds {} characters",
                    MAX_PROMPT_CHARS
                ))
                .into());
            }
        }

        if let Some(partial) = &self.partial_code {
            if partial.len() > MAX_PARTIAL_CODE_CHARS {
                return Err(SitesmithError::InvalidRequest(
                    "partialCode is too large to resume from".into(),
                )
                .into());
            }
        }

        Ok(())
    }

    /// Non-empty resume seed, if any.
    pub fn resume_seed(&self) -> Option<&str> {
        self.partial_code.as_deref().filter(|p| !p.is_empty())
    }
}

/// --- FILES ---

/// Relative path -> file content. Sorted keys give a deterministic write order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct FileSet(BTreeMap<String, String>);

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites; the last write for a path wins.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.0.insert(path.into(), content.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn total_bytes(&self) -> usize {
        self.0.values().map(String::len).sum()
    }
}

impl FromIterator<(String, String)> for FileSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// --- EVENTS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Status {
        message: String,
    },
    Content {
        content: String,
    },
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        files: FileSet,
        preview_url: String,
        sandbox_id: String,
        provider: String,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fragment_id: Option<String>,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Complete { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Status { .. } => "status",
            StreamEvent::Content { .. } => "content",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Complete { .. } => "complete",
        }
    }
}

/// --- RESULTS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub model: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerHealth {
    Ready,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub files: FileSet,
    pub preview_url: String,
    pub sandbox_id: String,
    pub raw_text: String,
    pub provider: String,
    pub model: String,
    pub attempts: Vec<ProviderAttempt>,
    pub fragment_id: String,
    pub server_health: ServerHealth,
}

/// --- PROVIDER WIRE TYPES ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum LineEvent {
    Delta(ProviderChunk),
    Error(ProviderErrorBody),
    Unknown(String),
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ProviderChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ProviderChunkChoice>,
    pub usage: Option<Usage>,
}

impl ProviderChunk {
    /// Concatenated text of every choice's delta.
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|c| c.delta.content.as_deref())
            .collect()
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ProviderChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ProviderDelta,
    pub finish_reason: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
pub struct ProviderDelta {
    pub role: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct ProviderErrorBody {
    pub error: ProviderErrorDetails,
}

#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct ProviderErrorDetails {
    pub message: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,

    /// Catch-all for extra provider fields like `type` or `param`
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

const MAX_CHUNK_BYTES: usize = 10 * 1024 * 1024;

pub fn parse_provider_line(data: &str) -> LineEvent {
    if data.len() > MAX_CHUNK_BYTES {
        return LineEvent::Error(ProviderErrorBody {
            error: ProviderErrorDetails {
                message: format!("JSON chunk too large: {} bytes", data.len()),
                code: Some(serde_json::json!(413)),
                extra: serde_json::Map::new(),
            },
        });
    }
    // Error first: it is the more specific shape (requires an "error" key)
    if let Ok(err) = serde_json::from_str::<ProviderErrorBody>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(chunk) = serde_json::from_str::<ProviderChunk>(data) {
        if !chunk.choices.is_empty() || chunk.usage.is_some() {
            return LineEvent::Delta(chunk);
        }
    }
    tracing::debug!(
        "[STREAM] Unknown line format: {}",
        crate::str_utils::prefix_chars(data, 200)
    );
    LineEvent::Unknown(data.to_string())
}
