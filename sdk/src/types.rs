//! Boundary types shared between the engine and host integrations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Host thermal state, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalLevel {
    /// Normal operating temperature
    Nominal,

    /// Slightly elevated
    Fair,

    /// High enough that sustained work should be shed
    Serious,

    /// Imminent throttling or shutdown
    Critical,
}

impl fmt::Display for ThermalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThermalLevel::Nominal => write!(f, "nominal"),
            ThermalLevel::Fair => write!(f, "fair"),
            ThermalLevel::Serious => write!(f, "serious"),
            ThermalLevel::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for ThermalLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nominal" => Ok(ThermalLevel::Nominal),
            "fair" => Ok(ThermalLevel::Fair),
            "serious" => Ok(ThermalLevel::Serious),
            "critical" => Ok(ThermalLevel::Critical),
            other => Err(format!(
                "Invalid thermal level '{}'. Must be one of: nominal, fair, serious, critical",
                other
            )),
        }
    }
}

/// A host-reported resource-pressure signal
///
/// Carries nothing beyond its tag; the monitor translates it into a
/// cancellation request and forgets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "level", rename_all = "snake_case")]
pub enum PressureEvent {
    /// The host reported low memory
    MemoryWarning,

    /// A thermal sample at or above the cancellation threshold
    ThermalLevel(ThermalLevel),
}

impl fmt::Display for PressureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureEvent::MemoryWarning => write!(f, "memory warning"),
            PressureEvent::ThermalLevel(level) => write!(f, "thermal level {}", level),
        }
    }
}

/// A single health measurement used to ground the system prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetric {
    /// Metric name (e.g. "resting heart rate")
    pub name: String,

    /// Measured value
    pub value: f64,

    /// Unit of the value (e.g. "bpm")
    #[serde(default)]
    pub unit: String,

    /// Free-form time description (e.g. "7-day average")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

impl HealthMetric {
    /// Create a new metric without a period
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            period: None,
        }
    }

    /// Attach a period description
    pub fn with_period(mut self, period: impl Into<String>) -> Self {
        self.period = Some(period.into());
        self
    }
}

impl fmt::Display for HealthMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)?;
        if !self.unit.is_empty() {
            write!(f, " {}", self.unit)?;
        }
        if let Some(period) = &self.period {
            write!(f, " ({})", period)?;
        }
        Ok(())
    }
}
