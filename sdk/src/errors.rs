//! Error types and handling
//!
//! This module provides the error type shared by the engine and by host
//! integrations (sensors, data sources). Errors implement the
//! `VitalisErrorExt` trait which provides user-friendly hints and indicates
//! whether the failure is recoverable.
//!
//! # Privacy
//!
//! Hints are static strings. They never echo the wrapped message, which may
//! contain health data or local file paths.

use thiserror::Error;

/// Trait for Vitalis error extensions
///
/// Provides additional context for errors, including user-friendly hints and
/// recoverability information.
pub trait VitalisErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// health data, file paths or internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried by the caller. The engine itself
    /// never retries.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// Covers failures outside the generation path: configuration, I/O,
/// host platform sensors and external data sources.
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, VitalisErrorExt};
///
/// let error = EngineError::Platform("no thermal zones".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::Config("bad log level".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Host platform errors (sensors, notifications)
    #[error("Platform error: {0}")]
    Platform(String),

    // External data source errors (health metrics, clinical records)
    #[error("Data source error: {0}")]
    DataSource(String),

    // Lifecycle misuse (e.g. starting a service twice)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VitalisErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Platform(_) => "A system sensor is unavailable. Pressure checks may be skipped",
            Self::DataSource(_) => "Some health data could not be loaded",
            Self::InvalidState(_) => "Operation not allowed in the current state",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}
