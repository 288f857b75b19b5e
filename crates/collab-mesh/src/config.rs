/// Collaboration tuning knobs
/// Timeouts and heuristics are configuration so tests can shrink them
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Online/offline heuristic settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectivityConfig {
    /// How often peer connection states are sampled (ms)
    pub sample_interval_ms: u64,

    /// How long every peer must look dead before going offline (ms)
    pub offline_grace_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            offline_grace_ms: 1_000,
        }
    }
}

impl ConnectivityConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_millis(self.offline_grace_ms)
    }
}

/// Collaboration session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollabConfig {
    /// Timeout for a single peer request (ms)
    pub request_timeout_ms: u64,

    /// Batching window for local selection broadcasts (ms)
    pub selection_debounce_ms: u64,

    /// Capacity of the session event channel
    pub event_capacity: usize,

    pub connectivity: ConnectivityConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            selection_debounce_ms: 50,
            event_capacity: 256,
            connectivity: ConnectivityConfig::default(),
        }
    }
}

impl CollabConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn selection_debounce(&self) -> Duration {
        Duration::from_millis(self.selection_debounce_ms)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_selection_debounce(mut self, debounce: Duration) -> Self {
        self.selection_debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.connectivity.sample_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_offline_grace(mut self, grace: Duration) -> Self {
        self.connectivity.offline_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Save configuration to JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from JSON
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.selection_debounce(), Duration::from_millis(50));
        assert_eq!(config.connectivity.sample_interval(), Duration::from_secs(1));
        assert_eq!(config.connectivity.offline_grace(), Duration::from_secs(1));
    }

    #[test]
    fn test_builder_overrides() {
        let config = CollabConfig::default()
            .with_request_timeout(Duration::from_millis(200))
            .with_sample_interval(Duration::from_millis(10))
            .with_offline_grace(Duration::from_millis(20));

        assert_eq!(config.request_timeout_ms, 200);
        assert_eq!(config.connectivity.sample_interval_ms, 10);
        assert_eq!(config.connectivity.offline_grace_ms, 20);
    }

    #[test]
    fn test_partial_json_is_rejected() {
        // No serde defaults on the fields
        let result: std::result::Result<CollabConfig, _> =
            serde_json::from_str(r#"{"request_timeout_ms": 10}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("collab_config_{}.json", uuid::Uuid::new_v4()));
        let config = CollabConfig::default().with_selection_debounce(Duration::from_millis(5));

        config.save(&path).unwrap();
        let loaded = CollabConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let path = std::env::temp_dir().join(format!("collab_missing_{}.json", uuid::Uuid::new_v4()));
        assert!(matches!(
            CollabConfig::load(&path),
            Err(crate::CollaborationError::Io(_))
        ));
    }
}
