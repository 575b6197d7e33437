//! Snapshot configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Budget for acquiring graph-wide readonly
    pub readonly_timeout: Duration,

    /// Name the aside directory after the previous persist time (otherwise
    /// after the current time)
    pub aside_suffix_ts: bool,

    /// Also write the human-readable `.adoc` report
    pub write_report: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            readonly_timeout: Duration::from_secs(30),
            aside_suffix_ts: true,
            write_report: true,
        }
    }
}

impl SnapshotConfig {
    /// Set the readonly acquisition budget
    pub fn with_readonly_timeout(mut self, timeout: Duration) -> Self {
        self.readonly_timeout = timeout;
        self
    }

    /// Enable/disable the `.adoc` report
    pub fn with_report(mut self, enabled: bool) -> Self {
        self.write_report = enabled;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.readonly_timeout.is_zero() {
            return Err("readonly_timeout must be greater than zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SnapshotConfig::default();
        assert_eq!(config.readonly_timeout, Duration::from_secs(30));
        assert!(config.write_report);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = SnapshotConfig::default().with_readonly_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
