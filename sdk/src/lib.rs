//! Vitalis SDK
//!
//! Shared library providing the error type, boundary types and port traits
//! used by the engine and by host integrations (sensors, data sources).

/// Error types and handling
pub mod errors;

/// Boundary types (thermal levels, pressure events, health metrics)
pub mod types;

/// Port traits implemented by the host
pub mod ports;

// Re-export commonly used types
pub use errors::{EngineError, VitalisErrorExt};
pub use ports::{ClinicalRecordsSource, HealthMetricsSource, MemoryWarningSource, ThermalSensor};
pub use types::{HealthMetric, PressureEvent, ThermalLevel};
