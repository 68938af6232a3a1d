//! Rolling latency window and connection quality classification.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest allowed window.
pub const MIN_WINDOW: usize = 10;
/// Largest allowed window.
pub const MAX_WINDOW: usize = 100;

/// Link quality derived from recent ack latency and reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// No samples yet.
    #[default]
    Unknown,
    /// Average latency under 100ms.
    Excellent,
    /// Under 500ms.
    Good,
    /// Under 1s.
    Fair,
    /// 1s or more.
    Poor,
    /// The host is unreachable.
    Disconnected,
}

impl ConnectionQuality {
    /// Classify an average round-trip latency.
    pub fn from_latency(average: Duration) -> Self {
        match average.as_millis() {
            0..=99 => Self::Excellent,
            100..=499 => Self::Good,
            500..=999 => Self::Fair,
            _ => Self::Poor,
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Fixed-size window of the most recent round-trip latencies.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    /// Create a window holding `capacity` samples, clamped to 10..=100.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_WINDOW, MAX_WINDOW);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sample, discarding the oldest if full.
    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    /// Mean of the samples in the window.
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Classify quality given the current reachability flag.
    pub fn quality(&self, reachable: bool) -> ConnectionQuality {
        if !reachable {
            return ConnectionQuality::Disconnected;
        }
        self.average()
            .map(ConnectionQuality::from_latency)
            .unwrap_or(ConnectionQuality::Unknown)
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Window size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(50)
    }
}
