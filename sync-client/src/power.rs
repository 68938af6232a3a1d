//! Background power monitor.
//!
//! Samples a [`PowerSource`] periodically, also reacts to OS power events
//! reported between samples, and publishes the resulting [`PowerProfile`]
//! over a watch channel. Only this task writes the profile.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use linkwise_sync_core::PowerScheduler;
use linkwise_sync_types::{OptimizationLevel, PowerProfile, PowerSignal, SyncError};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use crate::events::{ObserverRegistry, SyncEvent};

/// Reported events buffered between samples.
const REPORT_BUFFER: usize = 16;

/// Reads the device's battery and thermal state.
pub trait PowerSource: Send + Sync + 'static {
    /// Take one sample.
    fn sample(&self) -> PowerSignal;
}

/// Power source whose signal is set by hand.
///
/// Clones share the same signal.
#[derive(Debug, Clone, Default)]
pub struct ManualPowerSource {
    signal: Arc<Mutex<PowerSignal>>,
}

impl ManualPowerSource {
    /// Start at the given signal.
    pub fn new(signal: PowerSignal) -> Self {
        Self {
            signal: Arc::new(Mutex::new(signal)),
        }
    }

    /// Change what the next sample returns.
    pub fn set(&self, signal: PowerSignal) {
        if let Ok(mut current) = self.signal.lock() {
            *current = signal;
        }
    }
}

impl PowerSource for ManualPowerSource {
    fn sample(&self) -> PowerSignal {
        self.signal
            .lock()
            .map(|signal| *signal)
            .unwrap_or_default()
    }
}

/// Read side of the power monitor.
#[derive(Debug, Clone)]
pub struct PowerMonitor {
    profile: watch::Receiver<PowerProfile>,
    reports: mpsc::Sender<PowerSignal>,
}

impl PowerMonitor {
    /// Current profile.
    pub fn profile(&self) -> PowerProfile {
        self.profile.borrow().clone()
    }

    /// Current level.
    pub fn level(&self) -> OptimizationLevel {
        self.profile.borrow().optimization_level
    }

    /// Receiver notified on every profile change.
    pub fn subscribe(&self) -> watch::Receiver<PowerProfile> {
        self.profile.clone()
    }

    /// Feed an OS power event (battery level or low-power-mode change)
    /// without waiting for the next sample.
    pub async fn report(&self, signal: PowerSignal) -> Result<(), SyncError> {
        self.reports
            .send(signal)
            .await
            .map_err(|_| SyncError::Stopped)
    }
}

/// Spawn the power monitor task.
///
/// The source is sampled once before this returns, so the first profile
/// already reflects the device. The task exits once every [`PowerMonitor`]
/// clone has been dropped.
pub fn spawn_power_monitor<S: PowerSource>(
    source: S,
    mut scheduler: PowerScheduler,
    sample_interval: Duration,
    observers: ObserverRegistry,
) -> (PowerMonitor, tokio::task::JoinHandle<()>) {
    apply_signal(&mut scheduler, source.sample(), &observers);

    let (profile_tx, profile_rx) = watch::channel(scheduler.profile().clone());
    let (reports_tx, mut reports_rx) = mpsc::channel(REPORT_BUFFER);

    let handle = tokio::spawn(async move {
        tracing::info!(
            "Power monitor started (interval: {}s, level: {})",
            sample_interval.as_secs(),
            scheduler.level()
        );

        let mut timer = interval(sample_interval);
        // The first tick completes immediately; we already sampled.
        timer.tick().await;

        loop {
            let signal = tokio::select! {
                _ = timer.tick() => source.sample(),
                Some(signal) = reports_rx.recv() => signal,
            };

            apply_signal(&mut scheduler, signal, &observers);

            let profile = scheduler.profile().clone();
            profile_tx.send_if_modified(|current| {
                if *current == profile {
                    false
                } else {
                    *current = profile;
                    true
                }
            });

            if profile_tx.is_closed() {
                tracing::info!("Power monitor stopped");
                break;
            }
        }
    });

    let monitor = PowerMonitor {
        profile: profile_rx,
        reports: reports_tx,
    };
    (monitor, handle)
}

fn apply_signal(scheduler: &mut PowerScheduler, signal: PowerSignal, observers: &ObserverRegistry) {
    match scheduler.update(signal) {
        Some(transition) => {
            tracing::info!(
                "Optimization level {} -> {} (battery: {:.0}%, thermal: {:?}, low power: {})",
                transition.from,
                transition.to,
                signal.battery_level * 100.0,
                signal.thermal_state,
                signal.low_power_mode
            );
            observers.publish(SyncEvent::LevelChanged {
                from: transition.from,
                to: transition.to,
            });
        }
        None => {
            tracing::debug!(
                "Power sample: battery {:.0}%, level {}",
                signal.battery_level * 100.0,
                scheduler.level()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use linkwise_sync_types::{EntityType, ThermalState};

    fn battery(level: f32) -> PowerSignal {
        PowerSignal::new(level, ThermalState::Nominal, false)
    }

    fn spawn(source: &ManualPowerSource, observers: &ObserverRegistry) -> PowerMonitor {
        let (monitor, _handle) = spawn_power_monitor(
            source.clone(),
            PowerScheduler::default(),
            Duration::from_secs(30),
            observers.clone(),
        );
        monitor
    }

    #[tokio::test(start_paused = true)]
    async fn first_profile_reflects_initial_sample() {
        let source = ManualPowerSource::new(battery(0.05));
        let monitor = spawn(&source, &ObserverRegistry::new());

        assert_eq!(monitor.level(), OptimizationLevel::Aggressive);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_event_applies_before_next_sample() {
        let source = ManualPowerSource::new(battery(0.9));
        let observers = ObserverRegistry::new();
        let log = EventLog::new();
        observers.register(&log);
        let monitor = spawn(&source, &observers);
        let mut profile = monitor.subscribe();

        monitor.report(battery(0.05)).await.unwrap();
        profile.changed().await.unwrap();

        assert_eq!(monitor.level(), OptimizationLevel::Aggressive);
        assert!(log.events().contains(&SyncEvent::LevelChanged {
            from: OptimizationLevel::Standard,
            to: OptimizationLevel::Aggressive,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sample_picks_up_changes() {
        let source = ManualPowerSource::new(battery(0.9));
        let monitor = spawn(&source, &ObserverRegistry::new());
        assert_eq!(monitor.level(), OptimizationLevel::Standard);

        source.set(battery(0.30));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(monitor.level(), OptimizationLevel::Conservative);
    }

    #[tokio::test(start_paused = true)]
    async fn level_holds_inside_hysteresis_band() {
        let source = ManualPowerSource::new(battery(0.05));
        let monitor = spawn(&source, &ObserverRegistry::new());

        source.set(battery(0.20));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(monitor.level(), OptimizationLevel::Aggressive);

        source.set(battery(0.90));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(monitor.level(), OptimizationLevel::Standard);
    }

    #[tokio::test(start_paused = true)]
    async fn intervals_stretch_with_level() {
        let source = ManualPowerSource::new(battery(0.9));
        let monitor = spawn(&source, &ObserverRegistry::new());
        let standard = monitor.profile().interval(EntityType::Scorecard).unwrap();

        source.set(PowerSignal::new(0.9, ThermalState::Nominal, true));
        tokio::time::sleep(Duration::from_secs(31)).await;

        let conservative = monitor.profile().interval(EntityType::Scorecard).unwrap();
        assert!(conservative > standard);
    }

    #[tokio::test(start_paused = true)]
    async fn task_exits_when_monitor_dropped() {
        let source = ManualPowerSource::new(battery(0.9));
        let (monitor, handle) = spawn_power_monitor(
            source,
            PowerScheduler::default(),
            Duration::from_secs(1),
            ObserverRegistry::new(),
        );
        drop(monitor);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop")
            .expect("monitor should not panic");
    }
}
