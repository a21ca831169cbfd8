//! Ollama Model Backend
//!
//! Streams chat completions from a local Ollama server
//! (typically http://localhost:11434).
//!
//! Key features:
//! - Local execution (no API keys required)
//! - NDJSON streaming: one JSON object per line, `done: true` on the last
//! - Lines may be split across HTTP chunks; the decoder reassembles them
//! - Optional warm-up during setup so the first generation starts fast
//! - Stateless HTTP, so `reset_context` has nothing to drop

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use super::{BackendError, FragmentStream, Message, ModelBackend, Result, SessionSchema};
use crate::config::OllamaConfig;

/// Ollama backend configuration and HTTP client
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    /// Base URL for Ollama API (typically http://localhost:11434)
    base_url: String,

    /// Model name to use (e.g., "llama3.1:8b")
    model: String,

    /// Keep-alive hint sent with every request
    keep_alive: String,

    /// HTTP client for API requests
    client: Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend with default timeout and keep-alive
    ///
    /// # Arguments
    /// * `base_url` - Base URL for Ollama API (e.g., "http://localhost:11434")
    /// * `model` - Model name to use (e.g., "llama3.1:8b")
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> std::result::Result<Self, sdk::EngineError> {
        let config = OllamaConfig {
            base_url: base_url.into(),
            model: model.into(),
            ..OllamaConfig::default()
        };
        Self::from_config(&config)
    }

    /// Create a backend from configuration
    pub fn from_config(config: &OllamaConfig) -> std::result::Result<Self, sdk::EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| sdk::EngineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            keep_alive: config.keep_alive.clone(),
            client,
        })
    }

    /// Model name this backend requests
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Convert our Message format to Ollama's format
    fn convert_messages(messages: &[Message]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|msg| OllamaMessage {
                role: msg.role.to_string(),
                content: msg.content.clone(),
            })
            .collect()
    }

    fn map_request_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout
        } else if e.is_connect() {
            BackendError::Unavailable(format!(
                "Cannot connect to Ollama at {}. Is Ollama running?",
                self.base_url
            ))
        } else {
            BackendError::Network(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        Err(BackendError::Unavailable(format!(
            "Ollama API error ({}): {}",
            status, error_text
        )))
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn setup(&self, schema: &SessionSchema) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;
        Self::check_status(response)
            .await
            .map_err(|e| BackendError::Setup(e.to_string()))?;

        if !schema.warm_up {
            return Ok(());
        }

        // An empty chat request makes Ollama load the model and keep it resident
        let start = std::time::Instant::now();
        let request = OllamaRequest {
            model: self.model.clone(),
            messages: Vec::new(),
            stream: false,
            keep_alive: self.keep_alive.clone(),
        };
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;
        Self::check_status(response)
            .await
            .map_err(|e| BackendError::Setup(e.to_string()))?;

        tracing::info!(
            "Ollama model {} warmed up in {:.1}s",
            self.model,
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    async fn generate(&self, messages: &[Message]) -> Result<FragmentStream> {
        let ollama_messages = Self::convert_messages(messages);

        tracing::debug!(
            "Ollama request: model={}, messages={}, total_chars={}",
            self.model,
            ollama_messages.len(),
            ollama_messages
                .iter()
                .map(|m| m.content.len())
                .sum::<usize>()
        );

        let request = OllamaRequest {
            model: self.model.clone(),
            messages: ollama_messages,
            stream: true,
            keep_alive: self.keep_alive.clone(),
        };

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;
        let response = Self::check_status(response).await?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(fragment_stream(body))
    }

    async fn reset_context(&self) -> Result<()> {
        Ok(())
    }
}

/// State threaded through the fragment stream
struct StreamState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    pending_error: Option<BackendError>,
    finished: bool,
}

impl StreamState {
    /// Parse complete lines into ready fragments; stops at `done` or an error
    fn absorb(&mut self, lines: Vec<String>) {
        for line in lines {
            match parse_line(&line) {
                Ok(ChunkEvent::Fragment(text)) => self.ready.push_back(text),
                Ok(ChunkEvent::Done(text)) => {
                    if let Some(text) = text {
                        self.ready.push_back(text);
                    }
                    self.finished = true;
                    return;
                }
                Ok(ChunkEvent::Empty) => {}
                Err(e) => {
                    self.pending_error = Some(e);
                    self.finished = true;
                    return;
                }
            }
        }
    }
}

/// Turn a raw NDJSON body into a stream of text fragments
fn fragment_stream(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> FragmentStream {
    let state = StreamState {
        body,
        decoder: LineDecoder::default(),
        ready: VecDeque::new(),
        pending_error: None,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(fragment) = st.ready.pop_front() {
                return Some((Ok(fragment), st));
            }
            if let Some(err) = st.pending_error.take() {
                return Some((Err(err), st));
            }
            if st.finished {
                return None;
            }

            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let lines = st.decoder.push(&chunk);
                    st.absorb(lines);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    let err = if e.is_timeout() {
                        BackendError::Timeout
                    } else {
                        BackendError::Network(format!("Error reading stream: {}", e))
                    };
                    return Some((Err(err), st));
                }
                None => {
                    let tail = st.decoder.finish().into_iter().collect();
                    st.absorb(tail);
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

/// Splits a byte stream into UTF-8 lines
#[derive(Debug, Default)]
struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    /// Feed a chunk; returns every line completed by it
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Flush a trailing line that had no newline
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[derive(Debug, PartialEq)]
enum ChunkEvent {
    Fragment(String),
    Done(Option<String>),
    Empty,
}

fn parse_line(line: &str) -> Result<ChunkEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ChunkEvent::Empty);
    }

    let chunk: OllamaChunk = serde_json::from_str(line)
        .map_err(|e| BackendError::Parse(format!("Failed to parse Ollama chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(BackendError::Model(error));
    }

    let text = chunk
        .message
        .map(|m| m.content)
        .filter(|content| !content.is_empty());

    if chunk.done {
        Ok(ChunkEvent::Done(text))
    } else {
        Ok(text.map(ChunkEvent::Fragment).unwrap_or(ChunkEvent::Empty))
    }
}

/// Ollama API request format
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    keep_alive: String,
}

/// Ollama message format
#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// One line of an Ollama streaming response
#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}
