//! Reconciliation configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;
use peersync_common::Result;

/// Durations on the wire and in config files are plain milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Which reconciliation variant a device runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncVariant {
    /// Elect a leader first; only the leader drives the run.
    Blocking,
    /// Every device reconciles against all others on its own.
    NonBlocking,
}

impl SyncVariant {
    /// Whether runs start with a master election.
    pub fn elects_leader(self) -> bool {
        matches!(self, SyncVariant::Blocking)
    }
}

/// Configuration for the background syncer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub variant: SyncVariant,
    /// Bound on small request/response exchanges (election, notices, deletes).
    #[serde(with = "millis")]
    pub exchange_timeout: Duration,
    /// Bound on collecting every peer's snapshot.
    #[serde(with = "millis")]
    pub snapshot_timeout: Duration,
    /// Bound on one chunk round trip.
    #[serde(with = "millis")]
    pub chunk_timeout: Duration,
    /// Overall bound on one transfer, checksum restarts included.
    #[serde(with = "millis")]
    pub transfer_session_timeout: Duration,
    /// Longest a follower keeps its watcher suspended for a leader's run.
    #[serde(with = "millis")]
    pub follower_hold_timeout: Duration,
    /// Backoff between checksum restarts.
    pub restart: RetryConfig,
    /// When runs are triggered.
    pub sync_mode: SyncMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            variant: SyncVariant::Blocking,
            exchange_timeout: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(10),
            transfer_session_timeout: Duration::from_secs(120),
            follower_hold_timeout: Duration::from_secs(60),
            restart: RetryConfig::new(8)
                .with_initial_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(5)),
            sync_mode: SyncMode::Manual,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_variant(mut self, variant: SyncVariant) -> Self {
        self.variant = variant;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrips_through_json() {
        let config = SyncConfig::default();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"exchange_timeout\": 5000"));

        let back = SyncConfig::from_json(&json).unwrap();
        assert_eq!(back.variant, SyncVariant::Blocking);
        assert_eq!(back.chunk_timeout, config.chunk_timeout);
        assert_eq!(back.restart.max_retries, config.restart.max_retries);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(
            r#"{"variant": "non_blocking", "sync_mode": {"Periodic": {"interval": 30000}}}"#,
        )
        .unwrap();

        assert!(!config.variant.elects_leader());
        assert_eq!(config.snapshot_timeout, Duration::from_secs(10));
        assert!(matches!(
            config.sync_mode,
            SyncMode::Periodic { interval } if interval == Duration::from_secs(30)
        ));
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(SyncConfig::from_json("{\"variant\": \"sideways\"}").is_err());
    }
}
