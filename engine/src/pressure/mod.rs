//! Pressure Monitor
//!
//! Turns two host signals into cancellation requests:
//!
//! - **Memory**: edge-triggered warnings from a [`MemoryWarningSource`].
//!   Every warning is forwarded immediately, with no debounce.
//! - **Thermal**: a [`ThermalSensor`] sampled on a fixed interval. A sample
//!   at or above the configured level is forwarded.
//!
//! The monitor knows nothing about sessions. Its owner supplies the
//! `on_signal` callback, usually wired to `SessionManager::on_pressure`.

use sdk::errors::EngineError;
use sdk::ports::{MemoryWarningSource, ThermalSensor};
use sdk::types::{PressureEvent, ThermalLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PressureConfig;

/// Default thermal polling interval
pub const DEFAULT_THERMAL_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Monitor tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSettings {
    /// Time between thermal samples
    pub thermal_poll_interval: Duration,

    /// Thermal level at or above which a signal is raised
    pub cancel_at: ThermalLevel,
}

impl Default for PressureSettings {
    fn default() -> Self {
        Self {
            thermal_poll_interval: DEFAULT_THERMAL_POLL_INTERVAL,
            cancel_at: ThermalLevel::Serious,
        }
    }
}

impl PressureSettings {
    pub fn from_config(config: &PressureConfig) -> Self {
        Self {
            thermal_poll_interval: Duration::from_secs(config.thermal_poll_interval_secs),
            cancel_at: config.thermal_cancel_level,
        }
    }
}

/// Callback receiving pressure signals
pub type SignalHandler = Arc<dyn Fn(PressureEvent) + Send + Sync>;

/// Watches memory and thermal pressure while started
pub struct PressureMonitor {
    settings: PressureSettings,
    memory: Option<Box<dyn MemoryWarningSource>>,
    thermal: Arc<dyn ThermalSensor>,
    tasks: Vec<JoinHandle<()>>,
}

impl PressureMonitor {
    pub fn new(
        settings: PressureSettings,
        memory: Box<dyn MemoryWarningSource>,
        thermal: Arc<dyn ThermalSensor>,
    ) -> Self {
        Self {
            settings,
            memory: Some(memory),
            thermal,
            tasks: Vec::new(),
        }
    }

    /// Spawn the memory listener and the thermal poller
    ///
    /// The memory source is consumed by the first start, so a monitor can
    /// be started only once.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` if the monitor was already started.
    pub fn start<F>(&mut self, on_signal: F) -> Result<(), EngineError>
    where
        F: Fn(PressureEvent) + Send + Sync + 'static,
    {
        let memory = self.memory.take().ok_or_else(|| {
            EngineError::InvalidState("Pressure monitor already started".to_string())
        })?;
        let on_signal: SignalHandler = Arc::new(on_signal);

        self.tasks.push(tokio::spawn(watch_memory(memory, on_signal.clone())));
        self.tasks.push(tokio::spawn(poll_thermal(
            self.thermal.clone(),
            self.settings,
            on_signal,
        )));

        tracing::info!(
            "Pressure monitor started (thermal every {:?}, cancel at {})",
            self.settings.thermal_poll_interval,
            self.settings.cancel_at
        );
        Ok(())
    }

    /// Abort both watchers; calling it again is harmless
    pub fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("Pressure monitor stopped");
    }

    /// Whether the watchers are running
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for PressureMonitor {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn watch_memory(mut source: Box<dyn MemoryWarningSource>, on_signal: SignalHandler) {
    while source.next_warning().await.is_some() {
        tracing::warn!("Memory warning received");
        on_signal(PressureEvent::MemoryWarning);
    }
    tracing::debug!("Memory warning source closed");
}

async fn poll_thermal(
    sensor: Arc<dyn ThermalSensor>,
    settings: PressureSettings,
    on_signal: SignalHandler,
) {
    let mut ticker = tokio::time::interval(settings.thermal_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failing = false;

    loop {
        ticker.tick().await;

        match sensor.thermal_level().await {
            Ok(level) => {
                failing = false;
                tracing::trace!("Thermal level: {}", level);
                if level >= settings.cancel_at {
                    tracing::warn!("Thermal level {} reached", level);
                    on_signal(PressureEvent::ThermalLevel(level));
                }
            }
            Err(e) if !failing => {
                failing = true;
                tracing::warn!("Thermal sensor read failed: {}", e);
            }
            Err(e) => tracing::debug!("Thermal sensor still failing: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryWarningHub;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedSensor(ThermalLevel);

    #[async_trait]
    impl ThermalSensor for FixedSensor {
        async fn thermal_level(&self) -> Result<ThermalLevel, EngineError> {
            Ok(self.0)
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<PressureEvent>>>, impl Fn(PressureEvent) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |event: PressureEvent| {
            sink.lock().unwrap().push(event)
        })
    }

    #[tokio::test]
    async fn test_start_twice_is_error() {
        let hub = MemoryWarningHub::new();
        let mut monitor = PressureMonitor::new(
            PressureSettings::default(),
            Box::new(hub.into_source()),
            Arc::new(FixedSensor(ThermalLevel::Nominal)),
        );

        monitor.start(|_| {}).unwrap();
        assert!(monitor.is_running());
        let err = monitor.start(|_| {}).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_threshold_raises_nothing() {
        let hub = MemoryWarningHub::new();
        let _notifier = hub.notifier();
        let (events, on_signal) = recorder();
        let mut monitor = PressureMonitor::new(
            PressureSettings::default(),
            Box::new(hub.into_source()),
            Arc::new(FixedSensor(ThermalLevel::Fair)),
        );
        monitor.start(on_signal).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_thermal_at_threshold_signals_each_poll() {
        let hub = MemoryWarningHub::new();
        let _notifier = hub.notifier();
        let (events, on_signal) = recorder();
        let mut monitor = PressureMonitor::new(
            PressureSettings::default(),
            Box::new(hub.into_source()),
            Arc::new(FixedSensor(ThermalLevel::Serious)),
        );
        monitor.start(on_signal).unwrap();

        // Samples at 0s, 5s and 10s
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| *e == PressureEvent::ThermalLevel(ThermalLevel::Serious)));
    }

    #[tokio::test]
    async fn test_memory_warning_forwarded() {
        let hub = MemoryWarningHub::new();
        let notifier = hub.notifier();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut monitor = PressureMonitor::new(
            PressureSettings::default(),
            Box::new(hub.into_source()),
            Arc::new(FixedSensor(ThermalLevel::Nominal)),
        );
        monitor
            .start(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();

        notifier.notify();
        assert_eq!(rx.recv().await, Some(PressureEvent::MemoryWarning));
    }

    #[test]
    fn test_settings_from_config() {
        let config = PressureConfig {
            thermal_poll_interval_secs: 2,
            thermal_cancel_level: ThermalLevel::Critical,
            ..PressureConfig::default()
        };
        let settings = PressureSettings::from_config(&config);
        assert_eq!(settings.thermal_poll_interval, Duration::from_secs(2));
        assert_eq!(settings.cancel_at, ThermalLevel::Critical);
    }
}
