//! Session configuration.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SyncError;
use crate::types::Table;

// Validation limits
const MAX_CHANNEL_CAPACITY: usize = 1_000_000;
const MAX_PAGE_SIZE: usize = 10_000;
const MIN_INTERVAL_SECS: u64 = 1;
const MAX_HEARTBEAT_SECS: u64 = 3600;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Tunables for one sync session.
///
/// Every field has a default, so an empty JSON object is a valid config:
///
/// ```rust
/// use atelier_sync::SyncConfig;
///
/// let config: SyncConfig = serde_json::from_str("{\"pageSize\": 500}").unwrap();
/// assert_eq!(config.page_size, 500);
/// assert_eq!(config.channel_capacity, 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Tables to subscribe to. Primary tables among them are also bulk loaded.
    pub tables: Vec<Table>,

    /// Capacity of the dispatcher channel shared by the loader and the feed.
    pub channel_capacity: usize,

    /// Rows per snapshot page.
    pub page_size: usize,

    /// Interval between realtime heartbeats.
    pub heartbeat_secs: u64,

    /// Per-request timeout for snapshot reads.
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tables: Table::ALL.to_vec(),
            channel_capacity: 1024,
            page_size: 1000,
            heartbeat_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    /// The configured tables that are bulk loaded into a collection.
    pub fn collections(&self) -> Vec<Table> {
        self.tables.iter().copied().filter(|t| !t.is_join()).collect()
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check every value against its limits.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.tables.is_empty() {
            return Err(SyncError::Config("at least one table is required".to_string()));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.tables.iter().find(|t| !seen.insert(**t)) {
            return Err(SyncError::Config(format!("table {dup} is listed twice")));
        }

        if self.channel_capacity == 0 || self.channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(SyncError::Config(format!(
                "channel capacity must be between 1 and {MAX_CHANNEL_CAPACITY} (got {})",
                self.channel_capacity
            )));
        }

        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(SyncError::Config(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE} (got {})",
                self.page_size
            )));
        }

        if !(MIN_INTERVAL_SECS..=MAX_HEARTBEAT_SECS).contains(&self.heartbeat_secs) {
            return Err(SyncError::Config(format!(
                "heartbeat must be between {MIN_INTERVAL_SECS} and {MAX_HEARTBEAT_SECS} seconds (got {})",
                self.heartbeat_secs
            )));
        }

        if !(MIN_INTERVAL_SECS..=MAX_REQUEST_TIMEOUT_SECS).contains(&self.request_timeout_secs) {
            return Err(SyncError::Config(format!(
                "request timeout must be between {MIN_INTERVAL_SECS} and {MAX_REQUEST_TIMEOUT_SECS} seconds (got {})",
                self.request_timeout_secs
            )));
        }

        Ok(())
    }
}
