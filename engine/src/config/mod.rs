//! Configuration management
//!
//! This module handles loading, validation, and management of the Vitalis
//! configuration. Configuration is stored in TOML format at
//! ~/.vitalis/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level
//! - **backend**: Model backend selection and per-backend settings
//! - **generation**: Flush thresholds and conversation bounds
//! - **pressure**: Thermal polling and memory-warning settings
//! - **prompt**: System prompt preamble and optional health data files
//!
//! Every section except `core` is optional and falls back to defaults.
//!
//! # Examples
//!
//! ```no_run
//! use vitalis_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Backend: {}", config.backend.kind);
//! println!("Retained messages: {}", config.generation.max_messages);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::types::ThermalLevel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conversation::TrimPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Model backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Streaming and conversation bounds
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Resource pressure monitoring
    #[serde(default)]
    pub pressure: PressureConfig,

    /// System prompt assembly
    #[serde(default)]
    pub prompt: PromptConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Model backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend variant (ollama, scripted)
    #[serde(default = "default_backend_kind")]
    pub kind: String,

    /// Ollama backend settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Scripted (offline) backend settings
    #[serde(default)]
    pub scripted: ScriptedConfig,
}

/// Ollama backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,

    /// How long Ollama keeps the model loaded after a request (e.g. "5m")
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,

    /// Overall HTTP timeout for one request, including the streamed body
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Scripted backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedConfig {
    /// Canned reply streamed word by word
    #[serde(default = "default_scripted_reply")]
    pub reply: String,

    /// Delay before each fragment (milliseconds)
    #[serde(default = "default_fragment_delay")]
    pub fragment_delay_ms: u64,
}

/// Streaming and conversation bound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Flush buffered output at least this often (seconds)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: f64,

    /// Flush as soon as the buffer holds this many characters
    #[serde(default = "default_flush_min_chars")]
    pub flush_min_chars: usize,

    /// Messages retained when trimming before a run
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Assistant characters retained when trimming before a run
    #[serde(default = "default_max_assistant_chars")]
    pub max_assistant_chars: usize,
}

/// Pressure monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureConfig {
    /// Thermal polling interval (seconds)
    #[serde(default = "default_thermal_poll_interval")]
    pub thermal_poll_interval_secs: u64,

    /// Thermal level at or above which generation is canceled
    #[serde(default = "default_thermal_cancel_level")]
    pub thermal_cancel_level: ThermalLevel,

    /// /proc/meminfo polling interval for the Linux memory watcher (seconds)
    #[serde(default = "default_memory_poll_interval")]
    pub memory_poll_interval_secs: u64,

    /// Used-memory ratio (0.0-1.0] that raises a memory warning
    #[serde(default = "default_memory_warning_ratio")]
    pub memory_warning_ratio: f64,
}

/// System prompt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Opening instructions of every system prompt
    #[serde(default = "default_preamble")]
    pub preamble: String,

    /// JSON file with an array of health metrics (supports ~ expansion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_path: Option<PathBuf>,

    /// Plain-text clinical record export (supports ~ expansion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_path: Option<PathBuf>,

    /// Clinical record text beyond this many characters is cut off
    #[serde(default = "default_max_record_chars")]
    pub max_record_chars: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend_kind() -> String {
    "ollama".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_keep_alive() -> String {
    "5m".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_scripted_reply() -> String {
    "Your recent numbers look steady. Keep an eye on sleep and hydration, \
     and talk to your clinician about anything that worries you."
        .to_string()
}

fn default_fragment_delay() -> u64 {
    40
}

fn default_flush_interval() -> f64 {
    0.1
}

fn default_flush_min_chars() -> usize {
    32
}

fn default_max_messages() -> usize {
    12
}

fn default_max_assistant_chars() -> usize {
    16_000
}

fn default_thermal_poll_interval() -> u64 {
    5
}

fn default_thermal_cancel_level() -> ThermalLevel {
    ThermalLevel::Serious
}

fn default_memory_poll_interval() -> u64 {
    2
}

fn default_memory_warning_ratio() -> f64 {
    0.9
}

fn default_preamble() -> String {
    "You are a careful health assistant. Explain the user's health data in plain \
     language, never diagnose, and recommend consulting a clinician for medical decisions."
        .to_string()
}

fn default_max_record_chars() -> usize {
    6_000
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            ollama: OllamaConfig::default(),
            scripted: ScriptedConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
            keep_alive: default_keep_alive(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ScriptedConfig {
    fn default() -> Self {
        Self {
            reply: default_scripted_reply(),
            fragment_delay_ms: default_fragment_delay(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            flush_min_chars: default_flush_min_chars(),
            max_messages: default_max_messages(),
            max_assistant_chars: default_max_assistant_chars(),
        }
    }
}

impl GenerationConfig {
    /// Flush interval as a `Duration`
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_secs)
    }

    /// Trimming policy applied before every run
    pub fn trim_policy(&self) -> TrimPolicy {
        TrimPolicy {
            max_messages: self.max_messages,
            max_assistant_chars: self.max_assistant_chars,
        }
    }
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            thermal_poll_interval_secs: default_thermal_poll_interval(),
            thermal_cancel_level: default_thermal_cancel_level(),
            memory_poll_interval_secs: default_memory_poll_interval(),
            memory_warning_ratio: default_memory_warning_ratio(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            preamble: default_preamble(),
            metrics_path: None,
            records_path: None,
            max_record_chars: default_max_record_chars(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.vitalis/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read or written
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Wrote default configuration to {:?}", path);

        Ok(config)
    }

    /// Get the default configuration file path (~/.vitalis/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".vitalis").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig::default(),
            backend: BackendConfig::default(),
            generation: GenerationConfig::default(),
            pressure: PressureConfig::default(),
            prompt: PromptConfig::default(),
        }
    }

    /// Validate values and expand ~ in prompt data paths
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_backends = ["ollama", "scripted"];
        if !valid_backends.contains(&self.backend.kind.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid backend '{}'. Must be one of: {}",
                self.backend.kind,
                valid_backends.join(", ")
            )));
        }

        let interval = self.generation.flush_interval_secs;
        if !interval.is_finite() || interval <= 0.0 {
            return Err(EngineError::Config(
                "flush_interval_secs must be a positive number".to_string(),
            ));
        }
        if self.generation.flush_min_chars == 0 {
            return Err(EngineError::Config(
                "flush_min_chars must be at least 1".to_string(),
            ));
        }
        if self.generation.max_messages == 0 {
            return Err(EngineError::Config(
                "max_messages must be at least 1".to_string(),
            ));
        }

        if self.pressure.thermal_poll_interval_secs == 0 {
            return Err(EngineError::Config(
                "thermal_poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.pressure.memory_poll_interval_secs == 0 {
            return Err(EngineError::Config(
                "memory_poll_interval_secs must be at least 1".to_string(),
            ));
        }
        let ratio = self.pressure.memory_warning_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(EngineError::Config(
                "memory_warning_ratio must be greater than 0.0 and at most 1.0".to_string(),
            ));
        }

        if self.prompt.preamble.trim().is_empty() {
            return Err(EngineError::Config("prompt preamble must not be empty".to_string()));
        }

        if let Some(path) = &self.prompt.metrics_path {
            self.prompt.metrics_path = Some(expand_path(path)?);
        }
        if let Some(path) = &self.prompt.records_path {
            self.prompt.records_path = Some(expand_path(path)?);
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
