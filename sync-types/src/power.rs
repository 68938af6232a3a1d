//! Battery/thermal input and the power profile derived from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::EntityType;

/// OS-reported thermal pressure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    /// No thermal pressure.
    #[default]
    Nominal,
    /// Slightly elevated.
    Fair,
    /// High; the OS is throttling.
    Serious,
    /// Severe; shed all optional work.
    Critical,
}

impl ThermalState {
    /// Whether this state forces the most aggressive power saving.
    pub fn is_elevated(&self) -> bool {
        matches!(self, ThermalState::Serious | ThermalState::Critical)
    }
}

impl std::str::FromStr for ThermalState {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nominal" => Ok(ThermalState::Nominal),
            "fair" => Ok(ThermalState::Fair),
            "serious" => Ok(ThermalState::Serious),
            "critical" => Ok(ThermalState::Critical),
            other => Err(crate::SyncError::InvalidData(format!(
                "unknown thermal state: {other}"
            ))),
        }
    }
}

/// Discrete power-saving tier governing update cadence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    /// Full cadence.
    #[default]
    Standard,
    /// Stretched intervals.
    Conservative,
    /// Only critical/high traffic is drained; intervals heavily stretched.
    Aggressive,
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizationLevel::Standard => "standard",
            OptimizationLevel::Conservative => "conservative",
            OptimizationLevel::Aggressive => "aggressive",
        };
        f.write_str(name)
    }
}

/// One sample of the device's power state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSignal {
    /// Battery level in `[0, 1]`.
    pub battery_level: f32,
    /// Thermal pressure.
    pub thermal_state: ThermalState,
    /// OS low-power mode flag.
    pub low_power_mode: bool,
}

impl PowerSignal {
    /// Build a signal, clamping the battery level into `[0, 1]`.
    pub fn new(battery_level: f32, thermal_state: ThermalState, low_power_mode: bool) -> Self {
        let battery_level = if battery_level.is_nan() {
            0.0
        } else {
            battery_level.clamp(0.0, 1.0)
        };
        Self {
            battery_level,
            thermal_state,
            low_power_mode,
        }
    }
}

impl Default for PowerSignal {
    fn default() -> Self {
        Self::new(1.0, ThermalState::Nominal, false)
    }
}

/// The schedule derived from the latest power signal.
///
/// Written only by the power scheduler; everyone else reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerProfile {
    /// The signal this profile was computed from.
    pub signal: PowerSignal,
    /// Active optimization level.
    pub optimization_level: OptimizationLevel,
    /// Update interval per category.
    pub intervals: BTreeMap<EntityType, Duration>,
    /// Whether haptic feedback is allowed.
    pub haptics_enabled: bool,
    /// Minimum spacing between feedback events.
    pub min_feedback_interval: Duration,
}

impl PowerProfile {
    /// Interval for a category, if the scheduler knows it.
    pub fn interval(&self, category: EntityType) -> Option<Duration> {
        self.intervals.get(&category).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_level_is_clamped() {
        assert_eq!(PowerSignal::new(1.7, ThermalState::Nominal, false).battery_level, 1.0);
        assert_eq!(PowerSignal::new(-0.2, ThermalState::Nominal, false).battery_level, 0.0);
        assert_eq!(PowerSignal::new(f32::NAN, ThermalState::Nominal, false).battery_level, 0.0);
    }

    #[test]
    fn elevated_thermal_states() {
        assert!(!ThermalState::Nominal.is_elevated());
        assert!(!ThermalState::Fair.is_elevated());
        assert!(ThermalState::Serious.is_elevated());
        assert!(ThermalState::Critical.is_elevated());
    }

    #[test]
    fn thermal_state_parses() {
        assert_eq!("serious".parse::<ThermalState>().unwrap(), ThermalState::Serious);
        assert!("hot".parse::<ThermalState>().is_err());
    }
}
