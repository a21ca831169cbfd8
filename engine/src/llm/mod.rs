//! Model Backend Abstraction Layer
//!
//! This module provides the capability interface the session manager uses to
//! talk to a language model. Backends produce a lazy stream of text fragments
//! for a conversation; the caller cancels cooperatively by ceasing to pull.
//!
//! The set of backends is closed: `ModelSession` enumerates every variant and
//! is selected once, at construction, from configuration.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::BackendConfig;

pub mod ollama;
pub mod scripted;

pub use ollama::OllamaBackend;
pub use scripted::ScriptedBackend;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Lazy sequence of generated text fragments
///
/// Finite in practice (the backend decides when generation ends). An `Err`
/// item terminates the stream.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Errors that can occur while talking to a model backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Setup failed: {0}")]
    Setup(String),
}

impl sdk::VitalisErrorExt for BackendError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Unavailable(_) => "The model backend is not reachable. Is it running?",
            Self::Network(_) => "Network operation failed. Check your connection",
            Self::Timeout => "The model took too long to respond. Try again",
            Self::Parse(_) => "The model returned an unexpected response",
            Self::Model(_) => "The model reported an error while generating",
            Self::Setup(_) => "The model could not be prepared. Check the backend settings",
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Position in the conversation, assigned by the store on append
    #[serde(default)]
    pub seq: u64,

    /// Role of the message author
    pub role: MessageRole,

    /// Content of the message
    pub content: String,

    /// Generation run that produced this message (assistant messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a message with an explicit role
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role,
            content: content.into(),
            run_id: None,
        }
    }

    /// Content length in characters
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Role of a message author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions and notes injected by the application
    System,

    /// User message
    User,

    /// Model output
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Parameters for preparing a session
///
/// `guidelines` are appended to the assembled system prompt as a bullet list.
/// `warm_up` asks the backend to load the model eagerly during `prepare`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSchema {
    /// Name of the session kind, used in logs and events
    pub name: String,

    /// Extra response guidelines for the model
    #[serde(default)]
    pub guidelines: Vec<String>,

    /// Load the model during prepare instead of on first generation
    #[serde(default)]
    pub warm_up: bool,
}

impl SessionSchema {
    /// Create a schema without guidelines or warm-up
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guidelines: Vec::new(),
            warm_up: false,
        }
    }

    /// Add one response guideline
    pub fn with_guideline(mut self, guideline: impl Into<String>) -> Self {
        self.guidelines.push(guideline.into());
        self
    }

    /// Enable or disable warm-up
    pub fn with_warm_up(mut self, warm_up: bool) -> Self {
        self.warm_up = warm_up;
        self
    }
}

impl Default for SessionSchema {
    fn default() -> Self {
        Self::new("health-chat")
    }
}

/// Capability interface every model session variant implements
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Returns the name of the backend (e.g., "ollama", "scripted")
    fn name(&self) -> &str;

    /// Prepare the backend for a session (connectivity check, warm-up)
    async fn setup(&self, schema: &SessionSchema) -> Result<()>;

    /// Start generating a reply to the conversation
    ///
    /// Resolves once the backend has accepted the request; fragments are
    /// then pulled lazily from the returned stream.
    async fn generate(&self, messages: &[Message]) -> Result<FragmentStream>;

    /// Drop any context the backend keeps between generations
    async fn reset_context(&self) -> Result<()>;
}

/// Closed set of backend variants
pub enum ModelSession {
    /// HTTP streaming against a local Ollama server
    Ollama(OllamaBackend),

    /// Deterministic in-process backend
    Scripted(ScriptedBackend),
}

impl ModelSession {
    /// Build the variant selected by `config.kind`
    pub fn from_config(config: &BackendConfig) -> std::result::Result<Self, sdk::EngineError> {
        match config.kind.as_str() {
            "ollama" => Ok(ModelSession::Ollama(OllamaBackend::from_config(
                &config.ollama,
            )?)),
            "scripted" => Ok(ModelSession::Scripted(
                ScriptedBackend::from_reply(&config.scripted.reply)
                    .with_delay(Duration::from_millis(config.scripted.fragment_delay_ms)),
            )),
            other => Err(sdk::EngineError::Config(format!(
                "Unknown backend '{}'",
                other
            ))),
        }
    }
}

impl From<OllamaBackend> for ModelSession {
    fn from(backend: OllamaBackend) -> Self {
        ModelSession::Ollama(backend)
    }
}

impl From<ScriptedBackend> for ModelSession {
    fn from(backend: ScriptedBackend) -> Self {
        ModelSession::Scripted(backend)
    }
}

#[async_trait]
impl ModelBackend for ModelSession {
    fn name(&self) -> &str {
        match self {
            ModelSession::Ollama(b) => b.name(),
            ModelSession::Scripted(b) => b.name(),
        }
    }

    async fn setup(&self, schema: &SessionSchema) -> Result<()> {
        match self {
            ModelSession::Ollama(b) => b.setup(schema).await,
            ModelSession::Scripted(b) => b.setup(schema).await,
        }
    }

    async fn generate(&self, messages: &[Message]) -> Result<FragmentStream> {
        match self {
            ModelSession::Ollama(b) => b.generate(messages).await,
            ModelSession::Scripted(b) => b.generate(messages).await,
        }
    }

    async fn reset_context(&self) -> Result<()> {
        match self {
            ModelSession::Ollama(b) => b.reset_context().await,
            ModelSession::Scripted(b) => b.reset_context().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, MessageRole::User);
        assert_eq!(user_msg.content, "Hello");
        assert_eq!(user_msg.run_id, None);

        let assistant_msg = Message::assistant("Hi there");
        assert_eq!(assistant_msg.role, MessageRole::Assistant);

        let system_msg = Message::system("You are a helpful assistant");
        assert_eq!(system_msg.role, MessageRole::System);
    }

    #[test]
    fn test_char_len_counts_characters() {
        assert_eq!(Message::assistant("héllo").char_len(), 5);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("x")).unwrap();
        assert!(json.contains(r#""role":"assistant""#));
        assert!(!json.contains("run_id"));
    }

    #[test]
    fn test_schema_builder() {
        let schema = SessionSchema::new("labs")
            .with_guideline("Use short paragraphs")
            .with_warm_up(true);
        assert_eq!(schema.name, "labs");
        assert_eq!(schema.guidelines, vec!["Use short paragraphs".to_string()]);
        assert!(schema.warm_up);
    }

    #[test]
    fn test_session_from_config_selects_variant() {
        let mut config = BackendConfig::default();
        config.kind = "scripted".to_string();
        let session = ModelSession::from_config(&config).unwrap();
        assert_eq!(session.name(), "scripted");

        config.kind = "ollama".to_string();
        let session = ModelSession::from_config(&config).unwrap();
        assert_eq!(session.name(), "ollama");
    }
}
