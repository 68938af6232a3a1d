//! Show the power schedule for a device state.

use anyhow::Result;
use linkwise_sync_client::SyncConfig;
use linkwise_sync_core::PowerScheduler;
use linkwise_sync_types::{OptimizationLevel, PowerSignal, ThermalState};
use serde::Serialize;
use std::collections::BTreeMap;

/// Level and cadence chosen for one power signal.
#[derive(Debug, Serialize)]
pub struct ScheduleReport {
    /// The signal after clamping.
    pub signal: PowerSignal,
    /// Chosen optimization level.
    pub level: OptimizationLevel,
    /// Update interval per category, in milliseconds.
    pub intervals_ms: BTreeMap<String, u64>,
    /// Whether haptic feedback stays on.
    pub haptics_enabled: bool,
    /// Minimum spacing between feedback events, in milliseconds.
    pub min_feedback_interval_ms: u64,
}

/// Evaluate the signal against a freshly started scheduler.
///
/// Hysteresis is measured from `Standard`, the level every device boots at.
pub fn evaluate(config: &SyncConfig, signal: PowerSignal) -> ScheduleReport {
    let mut scheduler = PowerScheduler::new(config.power.scheduler());
    scheduler.update(signal);
    let profile = scheduler.profile();

    ScheduleReport {
        signal: profile.signal,
        level: profile.optimization_level,
        intervals_ms: profile
            .intervals
            .iter()
            .map(|(category, interval)| (category.to_string(), millis(*interval)))
            .collect(),
        haptics_enabled: profile.haptics_enabled,
        min_feedback_interval_ms: millis(profile.min_feedback_interval),
    }
}

/// Run the schedule command.
pub fn run(
    config: &SyncConfig,
    battery: f32,
    thermal: ThermalState,
    low_power: bool,
    json: bool,
) -> Result<()> {
    let report = evaluate(config, PowerSignal::new(battery, thermal, low_power));

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== sync-sim schedule ===");
    println!();
    println!(
        "Signal: battery {:.0}%, thermal {:?}, low power {}",
        report.signal.battery_level * 100.0,
        report.signal.thermal_state,
        report.signal.low_power_mode
    );
    println!("Level:  {}", report.level);
    println!();
    println!("Intervals:");
    for (category, interval) in &report.intervals_ms {
        println!("  {:<14} {:>8.1}s", category, *interval as f64 / 1000.0);
    }
    println!();
    println!(
        "Haptics: {} (min spacing {}ms)",
        if report.haptics_enabled { "on" } else { "off" },
        report.min_feedback_interval_ms
    );

    Ok(())
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
