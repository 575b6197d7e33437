//! Durability configuration
//!
//! Priority: environment variables > config file > defaults.

use crate::replication::ReplicationConfig;
use crate::snapshot::SnapshotConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of all environment overrides
pub const ENV_PREFIX: &str = "NEXUS_DURABILITY_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    /// Snapshot behaviour
    pub snapshot: SnapshotConfig,
    /// Replication behaviour
    pub replication: ReplicationConfig,
}

impl DurabilityConfig {
    /// Read a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::fs("read", path, e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate().map_err(Error::config)?;
        tracing::info!("Loaded durability configuration from {:?}", path);
        Ok(config)
    }

    /// Defaults with `NEXUS_DURABILITY_*` environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`
    ///
    /// Values that do not parse keep the current setting.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let millis = |name: &str| {
            var(name)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        if let Some(timeout) = millis("READONLY_TIMEOUT_MS") {
            self.snapshot.readonly_timeout = timeout;
        }
        if let Some(v) = var("WRITE_REPORT") {
            self.snapshot.write_report = v.parse::<bool>().unwrap_or(self.snapshot.write_report);
        }
        if let Some(v) = var("ASIDE_SUFFIX_TS") {
            self.snapshot.aside_suffix_ts =
                v.parse::<bool>().unwrap_or(self.snapshot.aside_suffix_ts);
        }

        let repl = &mut self.replication;
        if let Some(v) = var("BIND_ADDR") {
            repl.bind_addr = v.parse().unwrap_or(repl.bind_addr);
        }
        if let Some(v) = var("ADMIN_PORT") {
            repl.admin_port = v.parse().unwrap_or(repl.admin_port);
        }
        if let Some(timeout) = millis("ATTACH_TIMEOUT_MS") {
            repl.attach_timeout = timeout;
        }
        if let Some(timeout) = millis("CONNECT_TIMEOUT_MS") {
            repl.connect_timeout = timeout;
        }
        if let Some(timeout) = millis("HANDSHAKE_TIMEOUT_MS") {
            repl.handshake_timeout = timeout;
        }
        if let Some(timeout) = millis("SEND_TIMEOUT_MS") {
            repl.send_timeout = timeout;
        }
        if let Some(timeout) = millis("LOCK_DRAIN_TIMEOUT_MS") {
            repl.lock_drain_timeout = timeout;
        }
        if let Some(v) = var("QUEUE_CAPACITY") {
            repl.emitter_queue_capacity = v.parse().unwrap_or(repl.emitter_queue_capacity);
        }
        if let Some(v) = var("DEFAULT_SCHEME") {
            repl.default_scheme = v;
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.snapshot.validate()?;
        self.replication.validate()
    }
}
