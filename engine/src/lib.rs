//! Vitalis Engine Library
//!
//! This library provides the generation-session core of Vitalis: a
//! cancellable, throttled, pressure-aware streaming chat over a local model.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Message bus for session events
pub mod message_bus;

/// Model backend abstraction layer
pub mod llm;

/// Conversation store and trimming
pub mod conversation;

/// System prompt assembly
pub mod prompt;

/// Memory and thermal pressure monitoring
pub mod pressure;

/// Host pressure sources (meminfo, sysfs thermal zones)
pub mod platform;

/// Generation session manager
pub mod session;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
