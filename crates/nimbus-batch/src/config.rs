//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Records are swept once `expires_at + window * retention_multiplier` has passed
    #[serde(default = "default_retention_multiplier")]
    pub retention_multiplier: u32,

    /// Abort a batch's factory if it has not finished within this bound,
    /// counted from when the batch opens
    #[serde(default)]
    pub settle_timeout_ms: Option<u64>,
}

fn default_retention_multiplier() -> u32 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retention_multiplier: default_retention_multiplier(),
            settle_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn settle_timeout(&self) -> Option<Duration> {
        self.settle_timeout_ms.map(Duration::from_millis)
    }

    /// Sweep deadline for a batch expiring at `expires_at` (logical ms).
    pub(crate) fn retain_until(&self, expires_at: i64, window_ms: i64) -> i64 {
        let retention = window_ms.saturating_mul(i64::from(self.retention_multiplier.max(1)));
        expires_at.saturating_add(retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.retention_multiplier, 5);
        assert_eq!(config.settle_timeout(), None);
    }

    #[test]
    fn test_retain_until() {
        let config = SchedulerConfig::default();
        assert_eq!(config.retain_until(5000, 5000), 30_000);
    }

    #[test]
    fn test_zero_multiplier_still_retains_one_window() {
        let config = SchedulerConfig {
            retention_multiplier: 0,
            ..Default::default()
        };
        assert_eq!(config.retain_until(1000, 1000), 2000);
    }

    #[test]
    fn test_settle_timeout_duration() {
        let config = SchedulerConfig {
            settle_timeout_ms: Some(1500),
            ..Default::default()
        };
        assert_eq!(config.settle_timeout(), Some(Duration::from_millis(1500)));
    }
}
