//! Replication configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default inbound transaction port
pub const DEFAULT_TXPORT: u16 = 15475;

/// Attach/detach budgets below this are raised to it
pub const MIN_ATTACH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Replication configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Address the inbound listener binds to
    pub bind_addr: SocketAddr,

    /// Admin port reported to upstream providers
    pub admin_port: u16,

    /// Budget for attach/detach including fencing
    pub attach_timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Subscriber handshake timeout
    pub handshake_timeout: Duration,

    /// Timeout for one frame write to a producer
    pub send_timeout: Duration,

    /// Maximum commit groups queued per emitter
    pub emitter_queue_capacity: usize,

    /// Budget for writable vertex locks to clear on detach
    pub lock_drain_timeout: Duration,

    /// Scheme assumed for URIs given without one
    pub default_scheme: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TXPORT)),
            admin_port: 0,
            attach_timeout: MIN_ATTACH_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(30),
            emitter_queue_capacity: 100_000,
            lock_drain_timeout: Duration::from_secs(10),
            default_scheme: "vgx".to_string(),
        }
    }
}

impl ReplicationConfig {
    /// Set the inbound listener address
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the attach/detach budget
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// Set the per-frame send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the emitter queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.emitter_queue_capacity = capacity;
        self
    }

    /// Attach budget raised to the minimum
    pub fn effective_attach_timeout(&self, requested: Duration) -> Duration {
        requested.max(MIN_ATTACH_TIMEOUT)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.emitter_queue_capacity == 0 {
            return Err("emitter_queue_capacity must be at least 1".into());
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err("connect and handshake timeouts must be greater than zero".into());
        }
        if self.send_timeout.is_zero() {
            return Err("send_timeout must be greater than zero".into());
        }
        if self.default_scheme.is_empty() || self.default_scheme.contains(':') {
            return Err(format!("invalid default_scheme '{}'", self.default_scheme));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_TXPORT);
        assert_eq!(config.default_scheme, "vgx");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_attach_timeout_clamped() {
        let config = ReplicationConfig::default();
        assert_eq!(
            config.effective_attach_timeout(Duration::from_millis(10)),
            MIN_ATTACH_TIMEOUT
        );
        assert_eq!(
            config.effective_attach_timeout(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_invalid_config() {
        assert!(ReplicationConfig::default().with_queue_capacity(0).validate().is_err());
        let config = ReplicationConfig {
            default_scheme: "vgx:".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
