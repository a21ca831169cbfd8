//! System Prompt Assembly
//!
//! Builds the system message that opens every conversation. The prompt
//! grounds the model in the user's health data, pulled from two optional
//! sources: aggregated health metrics and clinical-record text.
//!
//! Assembly never fails because a data source is missing or broken. The
//! source is logged and left out, and the prompt gets shorter.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::ports::{ClinicalRecordsSource, HealthMetricsSource};
use sdk::types::HealthMetric;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PromptConfig;

/// Errors from prompt assembly
#[derive(Debug, Clone, thiserror::Error)]
pub enum PromptError {
    #[error("Assembled system prompt is empty")]
    Empty,
}

impl sdk::VitalisErrorExt for PromptError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Empty => "No system prompt could be built. Check the prompt preamble in config",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Produces the opening system prompt for a conversation
#[async_trait]
pub trait PromptAssembler: Send + Sync {
    async fn build_system_prompt(&self) -> Result<String, PromptError>;
}

/// Prompt assembler backed by health metric and clinical record sources
pub struct HealthPromptAssembler {
    preamble: String,
    metrics: Option<Arc<dyn HealthMetricsSource>>,
    records: Option<Arc<dyn ClinicalRecordsSource>>,
    max_record_chars: usize,
}

impl HealthPromptAssembler {
    /// Create an assembler with only a preamble
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into(),
            metrics: None,
            records: None,
            max_record_chars: usize::MAX,
        }
    }

    /// Build from the `[prompt]` config section, using file-backed sources
    pub fn from_config(config: &PromptConfig) -> Self {
        let mut assembler =
            Self::new(config.preamble.clone()).with_max_record_chars(config.max_record_chars);

        if let Some(path) = &config.metrics_path {
            assembler = assembler.with_metrics(Arc::new(JsonMetricsFile::new(path)));
        }
        if let Some(path) = &config.records_path {
            assembler = assembler.with_records(Arc::new(TextRecordsFile::new(path)));
        }

        assembler
    }

    pub fn with_metrics(mut self, source: Arc<dyn HealthMetricsSource>) -> Self {
        self.metrics = Some(source);
        self
    }

    pub fn with_records(mut self, source: Arc<dyn ClinicalRecordsSource>) -> Self {
        self.records = Some(source);
        self
    }

    /// Clinical record text beyond this many characters is cut off
    pub fn with_max_record_chars(mut self, max: usize) -> Self {
        self.max_record_chars = max;
        self
    }

    async fn fetch_metrics(&self) -> Vec<HealthMetric> {
        let Some(source) = &self.metrics else {
            return Vec::new();
        };
        match source.metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!("Health metrics unavailable, omitting from prompt: {}", e);
                Vec::new()
            }
        }
    }

    async fn fetch_records(&self) -> Option<String> {
        let source = self.records.as_ref()?;
        match source.records_text().await {
            Ok(text) => text.filter(|t| !t.trim().is_empty()),
            Err(e) => {
                tracing::warn!("Clinical records unavailable, omitting from prompt: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl PromptAssembler for HealthPromptAssembler {
    async fn build_system_prompt(&self) -> Result<String, PromptError> {
        let (metrics, records) = futures::join!(self.fetch_metrics(), self.fetch_records());

        let mut sections: Vec<String> = Vec::new();

        let preamble = self.preamble.trim();
        if !preamble.is_empty() {
            sections.push(preamble.to_string());
        }

        if !metrics.is_empty() {
            let lines: Vec<String> = metrics.iter().map(|m| format!("- {}", m)).collect();
            sections.push(format!("Recent health metrics:\n{}", lines.join("\n")));
        }

        if let Some(text) = records {
            let excerpt = truncate_chars(text.trim(), self.max_record_chars);
            sections.push(format!("Clinical records excerpt:\n{}", excerpt));
        }

        if sections.is_empty() {
            return Err(PromptError::Empty);
        }

        tracing::debug!(
            "Assembled system prompt: {} metrics, {} sections",
            metrics.len(),
            sections.len()
        );

        Ok(sections.join("\n\n"))
    }
}

/// Cut `text` to at most `max` characters without splitting a character
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Health metrics stored as a JSON array of `HealthMetric`
#[derive(Debug, Clone)]
pub struct JsonMetricsFile {
    path: PathBuf,
}

impl JsonMetricsFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl HealthMetricsSource for JsonMetricsFile {
    async fn metrics(&self) -> Result<Vec<HealthMetric>, EngineError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No metrics file at {:?}", self.path);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(EngineError::DataSource(format!(
                    "Failed to read metrics file {:?}: {}",
                    self.path, e
                )))
            }
        };

        serde_json::from_str(&contents).map_err(|e| {
            EngineError::DataSource(format!("Invalid metrics file {:?}: {}", self.path, e))
        })
    }
}

/// Clinical records exported as plain text
#[derive(Debug, Clone)]
pub struct TextRecordsFile {
    path: PathBuf,
}

impl TextRecordsFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ClinicalRecordsSource for TextRecordsFile {
    async fn records_text(&self) -> Result<Option<String>, EngineError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::DataSource(format!(
                "Failed to read records file {:?}: {}",
                self.path, e
            ))),
        }
    }
}
