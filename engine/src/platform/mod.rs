//! Host pressure sources
//!
//! Implementations of the sdk pressure ports for the machine the engine runs
//! on:
//!
//! - [`MemoryWarningHub`]: push channel for hosts that already receive OS
//!   low-memory notifications and only need to forward them.
//! - [`MeminfoWarningSource`]: Linux watcher that polls `/proc/meminfo` and
//!   raises one warning each time used memory crosses a ratio.
//! - [`SysfsThermalSensor`]: Linux thermal gauge reading
//!   `/sys/class/thermal/thermal_zone*/temp`.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use sdk::errors::EngineError;
use sdk::ports::{MemoryWarningSource, ThermalSensor};
use sdk::types::ThermalLevel;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// Pending warnings beyond this are coalesced
const WARNING_CHANNEL_CAPACITY: usize = 16;

const MEMINFO_PATH: &str = "/proc/meminfo";
const THERMAL_ROOT: &str = "/sys/class/thermal";

/// Channel connecting an OS notification callback to the pressure monitor
#[derive(Debug)]
pub struct MemoryWarningHub {
    sender: mpsc::Sender<()>,
    receiver: mpsc::Receiver<()>,
}

impl MemoryWarningHub {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(WARNING_CHANNEL_CAPACITY);
        Self { sender, receiver }
    }

    /// Handle for the code that receives OS notifications
    pub fn notifier(&self) -> MemoryWarningNotifier {
        MemoryWarningNotifier {
            sender: self.sender.clone(),
        }
    }

    /// Source side, handed to the pressure monitor
    ///
    /// The source closes once every notifier has been dropped.
    pub fn into_source(self) -> ChannelMemoryWarnings {
        ChannelMemoryWarnings {
            receiver: self.receiver,
        }
    }
}

impl Default for MemoryWarningHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable sender of memory warnings
#[derive(Debug, Clone)]
pub struct MemoryWarningNotifier {
    sender: mpsc::Sender<()>,
}

impl MemoryWarningNotifier {
    /// Report one low-memory event; never blocks
    pub fn notify(&self) {
        if let Err(mpsc::error::TrySendError::Full(())) = self.sender.try_send(()) {
            tracing::debug!("Memory warning coalesced with pending warnings");
        }
    }
}

/// Memory warnings delivered through a [`MemoryWarningHub`]
#[derive(Debug)]
pub struct ChannelMemoryWarnings {
    receiver: mpsc::Receiver<()>,
}

#[async_trait]
impl MemoryWarningSource for ChannelMemoryWarnings {
    async fn next_warning(&mut self) -> Option<()> {
        self.receiver.recv().await
    }
}

/// Memory figures from `/proc/meminfo`, in kB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
}

impl MemInfo {
    /// Parse the `MemTotal` and `MemAvailable` lines
    pub fn parse(contents: &str) -> Option<Self> {
        let mut total = None;
        let mut available = None;

        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            let field = match parts.next() {
                Some("MemTotal:") => &mut total,
                Some("MemAvailable:") => &mut available,
                _ => continue,
            };
            *field = parts.next().and_then(|v| v.parse::<u64>().ok());
        }

        Some(Self {
            mem_total_kb: total?,
            mem_available_kb: available?,
        })
    }

    /// Used-memory ratio, `1 - available / total`
    pub fn pressure(&self) -> f64 {
        if self.mem_total_kb == 0 {
            return 0.0;
        }
        (1.0 - self.mem_available_kb as f64 / self.mem_total_kb as f64).clamp(0.0, 1.0)
    }
}

/// Read the host's memory figures once
pub async fn read_meminfo() -> Result<MemInfo, EngineError> {
    let contents = tokio::fs::read_to_string(MEMINFO_PATH)
        .await
        .map_err(|e| EngineError::Platform(format!("Cannot read {}: {}", MEMINFO_PATH, e)))?;
    MemInfo::parse(&contents)
        .ok_or_else(|| EngineError::Platform(format!("Unexpected format in {}", MEMINFO_PATH)))
}

/// Turns a pressure gauge into edge-triggered warnings
///
/// Fires once when pressure reaches the threshold and re-arms only after it
/// drops back below.
#[derive(Debug, Clone)]
pub struct PressureLatch {
    threshold: f64,
    armed: bool,
}

impl PressureLatch {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            armed: true,
        }
    }

    /// Feed one sample; returns true on an upward crossing
    pub fn update(&mut self, pressure: f64) -> bool {
        if pressure < self.threshold {
            self.armed = true;
            return false;
        }
        let fired = self.armed;
        self.armed = false;
        fired
    }
}

type MeminfoReader = Box<dyn Fn() -> BoxFuture<'static, std::io::Result<String>> + Send + Sync>;

/// Linux memory watcher polling `/proc/meminfo`
pub struct MeminfoWarningSource {
    reader: MeminfoReader,
    poll_interval: Duration,
    ticker: Option<Interval>,
    latch: PressureLatch,
}

impl MeminfoWarningSource {
    /// Watch the host's `/proc/meminfo`
    pub fn new(warning_ratio: f64, poll_interval: Duration) -> Self {
        Self::with_reader(warning_ratio, poll_interval, || {
            tokio::fs::read_to_string(MEMINFO_PATH)
        })
    }

    /// Watch meminfo-formatted text produced by `reader`
    pub fn with_reader<F, Fut>(warning_ratio: f64, poll_interval: Duration, reader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<String>> + Send + 'static,
    {
        Self {
            reader: Box::new(move || reader().boxed()),
            poll_interval,
            ticker: None,
            latch: PressureLatch::new(warning_ratio),
        }
    }

    fn pressure_of(sample: std::io::Result<String>) -> Option<f64> {
        let contents = match sample {
            Ok(contents) => contents,
            Err(e) => {
                tracing::debug!("Memory sample failed: {}", e);
                return None;
            }
        };
        MemInfo::parse(&contents).map(|info| info.pressure())
    }
}

#[async_trait]
impl MemoryWarningSource for MeminfoWarningSource {
    async fn next_warning(&mut self) -> Option<()> {
        loop {
            let ticker = self.ticker.get_or_insert_with(|| {
                let mut ticker = tokio::time::interval(self.poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            ticker.tick().await;

            let read = (self.reader)();
            let sample = read.await;
            if let Some(pressure) = Self::pressure_of(sample) {
                if self.latch.update(pressure) {
                    tracing::debug!("Memory pressure at {:.0}%", pressure * 100.0);
                    return Some(());
                }
            }
        }
    }
}

/// Map a temperature in degrees Celsius to a thermal level
pub fn level_for_celsius(celsius: f64) -> ThermalLevel {
    if celsius < 60.0 {
        ThermalLevel::Nominal
    } else if celsius < 75.0 {
        ThermalLevel::Fair
    } else if celsius < 85.0 {
        ThermalLevel::Serious
    } else {
        ThermalLevel::Critical
    }
}

/// Linux thermal gauge: hottest of all readable thermal zones
#[derive(Debug, Clone)]
pub struct SysfsThermalSensor {
    root: PathBuf,
}

impl SysfsThermalSensor {
    pub fn new() -> Self {
        Self::with_root(THERMAL_ROOT)
    }

    /// Read zones below a different root (useful for tests and containers)
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Hottest zone temperature in degrees Celsius
    pub async fn max_celsius(&self) -> Result<f64, EngineError> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            EngineError::Platform(format!("Cannot list thermal zones in {:?}: {}", self.root, e))
        })?;

        let mut hottest: Option<i64> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("thermal_zone") {
                continue;
            }
            let Ok(raw) = tokio::fs::read_to_string(entry.path().join("temp")).await else {
                continue;
            };
            if let Ok(millidegrees) = raw.trim().parse::<i64>() {
                hottest = Some(hottest.map_or(millidegrees, |h| h.max(millidegrees)));
            }
        }

        hottest
            .map(|m| m as f64 / 1000.0)
            .ok_or_else(|| EngineError::Platform("No readable thermal zone".to_string()))
    }
}

impl Default for SysfsThermalSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThermalSensor for SysfsThermalSensor {
    async fn thermal_level(&self) -> Result<ThermalLevel, EngineError> {
        self.max_celsius().await.map(level_for_celsius)
    }
}
