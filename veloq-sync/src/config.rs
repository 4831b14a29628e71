//! Sync configuration.
//!
//! Defaults match what the app ships with; the mobile side may override any
//! field by passing a JSON object to `sync_init`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Default base URL of the intervals.icu REST API.
pub const DEFAULT_API_BASE_URL: &str = "https://intervals.icu/api/v1";

/// Configuration for the sync coordinator and its HTTP gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Activities fetched and committed together
    pub batch_size: usize,
    /// A batch that has not resolved after this long counts as failed
    pub batch_timeout_secs: u64,
    /// Extra attempts for a failed engine write of one batch
    pub engine_write_retries: u32,
    /// Rolling window requested after login or a cache reset
    pub default_window_days: u32,
    /// Base URL for the activity API
    pub api_base_url: String,
    /// In-flight stream requests within one batch
    pub max_concurrency: usize,
    /// Remove cached activities the remote listing no longer reports
    pub prune_deleted: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            batch_timeout_secs: 60,
            engine_write_retries: 1,
            default_window_days: 90,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            max_concurrency: 10,
            prune_deleted: true,
        }
    }
}

impl SyncConfig {
    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    /// Clamp values that would stall the coordinator.
    pub fn sanitized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.batch_timeout_secs = self.batch_timeout_secs.max(1);
        self.default_window_days = self.default_window_days.max(1);
        self.max_concurrency = self.max_concurrency.max(1);
        self
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(r#"{"batchSize": 5, "pruneDeleted": false}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert!(!config.prune_deleted);
        assert_eq!(config.default_window_days, 90);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let config = SyncConfig::from_json(r#"{"batchSize": 0, "maxConcurrency": 0}"#).unwrap();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(SyncConfig::from_json("{batchSize").is_err());
    }
}
