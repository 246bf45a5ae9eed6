//! Coordinator tuning

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_KEYFRAME_INTERVAL_MS: u64 = 1000;

/// Timing and limit knobs of the room coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Period of the per-room keyframe request ticker
    pub keyframe_interval_ms: u64,
    /// Immediate sync passes before falling back to a deferred retry
    pub max_sync_attempts: usize,
    /// Delay of the deferred retry
    pub retry_delay_ms: u64,
    /// How long a disconnected peer may recover before it is closed
    pub disconnect_grace_secs: u64,
    /// Maximum number of live rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum participants per room (0 = unlimited)
    pub max_participants_per_room: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            keyframe_interval_ms: DEFAULT_KEYFRAME_INTERVAL_MS,
            max_sync_attempts: 25,
            retry_delay_ms: 3000,
            disconnect_grace_secs: 20,
            max_rooms: 0,
            max_participants_per_room: 0,
        }
    }
}

impl SfuConfig {
    /// A zero interval falls back to the default period.
    #[must_use]
    pub const fn keyframe_interval(&self) -> Duration {
        if self.keyframe_interval_ms == 0 {
            return Duration::from_millis(DEFAULT_KEYFRAME_INTERVAL_MS);
        }
        Duration::from_millis(self.keyframe_interval_ms)
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub const fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    /// At least one pass always runs, even when configured with zero attempts.
    #[must_use]
    pub fn sync_attempts(&self) -> usize {
        self.max_sync_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SfuConfig::default();
        assert_eq!(config.keyframe_interval(), Duration::from_secs(1));
        assert_eq!(config.retry_delay(), Duration::from_secs(3));
        assert_eq!(config.disconnect_grace(), Duration::from_secs(20));
        assert_eq!(config.sync_attempts(), 25);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let config = SfuConfig {
            max_sync_attempts: 0,
            ..SfuConfig::default()
        };
        assert_eq!(config.sync_attempts(), 1);
    }

    #[test]
    fn test_zero_keyframe_interval_uses_default() {
        let config = SfuConfig {
            keyframe_interval_ms: 0,
            ..SfuConfig::default()
        };
        assert_eq!(config.keyframe_interval(), Duration::from_secs(1));
    }
}
