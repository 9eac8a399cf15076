/// Tunables for a collaboration session
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// Exponential backoff used after the transport drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based): base doubling per attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Two edits of the same target closer than this are a simultaneous edit
    pub simultaneous_edit_window_ms: i64,

    /// How many recently applied operations stay eligible for pairing
    pub detection_window: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            simultaneous_edit_window_ms: 1_000,
            detection_window: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub heartbeat_interval_ms: u64,

    /// Silence on the transport longer than this starts a reconnect
    pub heartbeat_timeout_ms: u64,

    /// Minimum spacing between outgoing cursor/playhead updates
    pub presence_throttle_ms: u64,

    /// Online users silent for longer are marked away
    pub idle_after_secs: i64,

    pub reconnect: ReconnectPolicy,
    pub detector: DetectorConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            presence_throttle_ms: 50,
            idle_after_secs: 60,
            reconnect: ReconnectPolicy::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl CollabConfig {
    /// Parses a JSON config; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn presence_throttle(&self) -> Duration {
        Duration::from_millis(self.presence_throttle_ms)
    }
}
