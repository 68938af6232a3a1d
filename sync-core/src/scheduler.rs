//! Power/thermal-aware scheduling for Linkwise.
//!
//! Maps a battery/thermal signal to an [`OptimizationLevel`] and a set of
//! per-category update intervals. Level changes use hysteresis: entering a
//! tier and leaving it use different thresholds, so a single fluctuation
//! around a boundary causes at most one transition.
//!
//! The scheduler is the only writer of intervals and feedback gating.
//! Everyone else reads the [`PowerProfile`] it produces.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use linkwise_sync_types::{EntityType, OptimizationLevel, PowerProfile, PowerSignal};

/// Battery thresholds for entering and leaving each tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisThresholds {
    /// Enter aggressive below this level.
    pub aggressive_enter: f32,
    /// Leave aggressive only above this level.
    pub aggressive_exit: f32,
    /// Enter conservative below this level.
    pub conservative_enter: f32,
    /// Leave conservative only above this level.
    pub conservative_exit: f32,
}

impl HysteresisThresholds {
    /// Whether each exit threshold sits above its entry threshold and the
    /// aggressive band sits below the conservative band.
    pub fn is_valid(&self) -> bool {
        self.aggressive_enter < self.aggressive_exit
            && self.conservative_enter < self.conservative_exit
            && self.aggressive_enter <= self.conservative_enter
    }
}

impl Default for HysteresisThresholds {
    fn default() -> Self {
        Self {
            aggressive_enter: 0.15,
            aggressive_exit: 0.25,
            conservative_enter: 0.35,
            conservative_exit: 0.45,
        }
    }
}

/// Interval multiplier per optimization level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelMultipliers {
    /// Multiplier under conservative.
    pub conservative: f64,
    /// Multiplier under aggressive.
    pub aggressive: f64,
}

impl LevelMultipliers {
    /// Accepted conservative multipliers.
    pub const CONSERVATIVE_RANGE: RangeInclusive<f64> = 1.5..=3.0;
    /// Accepted aggressive multipliers.
    pub const AGGRESSIVE_RANGE: RangeInclusive<f64> = 3.0..=6.0;

    /// Whether both multipliers fall inside their accepted ranges.
    pub fn is_valid(&self) -> bool {
        Self::CONSERVATIVE_RANGE.contains(&self.conservative)
            && Self::AGGRESSIVE_RANGE.contains(&self.aggressive)
    }

    /// Multiplier for a level. Standard is always 1.
    pub fn for_level(&self, level: OptimizationLevel) -> f64 {
        match level {
            OptimizationLevel::Standard => 1.0,
            OptimizationLevel::Conservative => self.conservative,
            OptimizationLevel::Aggressive => self.aggressive,
        }
    }
}

impl Default for LevelMultipliers {
    fn default() -> Self {
        Self {
            conservative: 2.0,
            aggressive: 4.0,
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Level thresholds.
    pub thresholds: HysteresisThresholds,
    /// Level multipliers.
    pub multipliers: LevelMultipliers,
    /// Interval per category at the standard level.
    pub baselines: BTreeMap<EntityType, Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thresholds: HysteresisThresholds::default(),
            multipliers: LevelMultipliers::default(),
            baselines: default_baselines(),
        }
    }
}

/// Standard-level interval for every category.
pub fn default_baselines() -> BTreeMap<EntityType, Duration> {
    EntityType::ALL
        .into_iter()
        .map(|category| {
            let secs = match category {
                EntityType::Scorecard | EntityType::ActiveRound => 5,
                EntityType::Leaderboard => 10,
                EntityType::Heartbeat => 15,
                EntityType::Tournament => 30,
                EntityType::Rating | EntityType::HealthMetrics => 60,
                EntityType::Course => 300,
            };
            (category, Duration::from_secs(secs))
        })
        .collect()
}

/// Extra stretch applied outside the standard level, by absolute battery.
pub fn battery_band_factor(battery_level: f32) -> f64 {
    if battery_level >= 0.20 {
        1.0
    } else if battery_level >= 0.10 {
        1.25
    } else {
        1.5
    }
}

/// Pick the next level from the current one and a fresh signal.
pub fn next_level(
    current: OptimizationLevel,
    signal: &PowerSignal,
    thresholds: &HysteresisThresholds,
) -> OptimizationLevel {
    let battery = signal.battery_level;
    let hot = signal.thermal_state.is_elevated();
    let enter_aggressive = battery < thresholds.aggressive_enter || hot;
    let enter_conservative = battery < thresholds.conservative_enter || signal.low_power_mode;

    match current {
        OptimizationLevel::Aggressive => {
            if battery > thresholds.aggressive_exit && !hot {
                if enter_conservative || battery <= thresholds.conservative_exit {
                    OptimizationLevel::Conservative
                } else {
                    OptimizationLevel::Standard
                }
            } else {
                OptimizationLevel::Aggressive
            }
        }
        OptimizationLevel::Conservative => {
            if enter_aggressive {
                OptimizationLevel::Aggressive
            } else if battery > thresholds.conservative_exit && !signal.low_power_mode {
                OptimizationLevel::Standard
            } else {
                OptimizationLevel::Conservative
            }
        }
        OptimizationLevel::Standard => {
            if enter_aggressive {
                OptimizationLevel::Aggressive
            } else if enter_conservative {
                OptimizationLevel::Conservative
            } else {
                OptimizationLevel::Standard
            }
        }
    }
}

/// A level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelTransition {
    /// Level before the signal.
    pub from: OptimizationLevel,
    /// Level after the signal.
    pub to: OptimizationLevel,
}

/// Stateful scheduler: holds the current level and derived profile.
#[derive(Debug, Clone)]
pub struct PowerScheduler {
    config: SchedulerConfig,
    profile: PowerProfile,
}

impl PowerScheduler {
    /// Create a scheduler at the standard level with a full battery.
    pub fn new(config: SchedulerConfig) -> Self {
        let profile = build_profile(&config, PowerSignal::default(), OptimizationLevel::Standard);
        Self { config, profile }
    }

    /// Apply a new signal; returns the transition if the level changed.
    pub fn update(&mut self, signal: PowerSignal) -> Option<LevelTransition> {
        let from = self.profile.optimization_level;
        let to = next_level(from, &signal, &self.config.thresholds);
        self.profile = build_profile(&self.config, signal, to);
        (from != to).then_some(LevelTransition { from, to })
    }

    /// Current level.
    pub fn level(&self) -> OptimizationLevel {
        self.profile.optimization_level
    }

    /// Current profile.
    pub fn profile(&self) -> &PowerProfile {
        &self.profile
    }

    /// Interval for a category under the current profile.
    pub fn interval(&self, category: EntityType) -> Option<Duration> {
        self.profile.interval(category)
    }
}

impl Default for PowerScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

fn build_profile(
    config: &SchedulerConfig,
    signal: PowerSignal,
    level: OptimizationLevel,
) -> PowerProfile {
    let factor = match level {
        OptimizationLevel::Standard => 1.0,
        _ => config.multipliers.for_level(level) * battery_band_factor(signal.battery_level),
    };
    let intervals = config
        .baselines
        .iter()
        .map(|(category, base)| (*category, base.mul_f64(factor)))
        .collect();

    let haptics_enabled =
        level != OptimizationLevel::Aggressive && !signal.thermal_state.is_elevated();
    let min_feedback_interval = match level {
        OptimizationLevel::Standard => Duration::from_secs(1),
        OptimizationLevel::Conservative => Duration::from_secs(3),
        OptimizationLevel::Aggressive => Duration::from_secs(10),
    };

    PowerProfile {
        signal,
        optimization_level: level,
        intervals,
        haptics_enabled,
        min_feedback_interval,
    }
}
