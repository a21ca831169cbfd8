//! Port traits implemented by the host platform
//!
//! The engine never talks to the operating system or to external health
//! services directly. Hosts provide these capabilities and the engine
//! consumes them through trait objects.

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::types::{HealthMetric, ThermalLevel};

/// Push-style low-memory notifications
///
/// Each returned `Some(())` is one edge-triggered pressure event. `None`
/// means the source is closed and no further warnings will arrive.
#[async_trait]
pub trait MemoryWarningSource: Send {
    /// Wait for the next memory warning
    async fn next_warning(&mut self) -> Option<()>;
}

/// Pull-style thermal gauge
#[async_trait]
pub trait ThermalSensor: Send + Sync {
    /// Sample the current thermal level
    async fn thermal_level(&self) -> Result<ThermalLevel, EngineError>;
}

/// Aggregated health metrics for prompt grounding
#[async_trait]
pub trait HealthMetricsSource: Send + Sync {
    /// Fetch the current metrics; an empty list is a valid answer
    async fn metrics(&self) -> Result<Vec<HealthMetric>, EngineError>;
}

/// Clinical-record text for prompt grounding
#[async_trait]
pub trait ClinicalRecordsSource: Send + Sync {
    /// Fetch record text, or `None` when the user has no records
    async fn records_text(&self) -> Result<Option<String>, EngineError>;
}
