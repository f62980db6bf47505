//! Configuration recognised by the record and registry subsystems.

use crate::{Result, RillError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Records whose name matches this pattern are only cached, never stored.
    #[serde(default)]
    pub storage_exclusion: Option<String>,
}

impl RecordConfig {
    pub fn storage_exclusion(&self) -> Result<StorageExclusion> {
        StorageExclusion::new(self.storage_exclusion.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRegistryConfig {
    /// Window over which checksum aggregation requests are coalesced.
    #[serde(default = "default_check_sum_buffer_ms")]
    pub check_sum_buffer_ms: u64,
    /// Delay before a drift-triggered full state request, and the window in
    /// which repeated full state requests from the same node are ignored.
    #[serde(default = "default_state_reconciliation_timeout_ms")]
    pub state_reconciliation_timeout_ms: u64,
}

fn default_check_sum_buffer_ms() -> u64 {
    100
}

fn default_state_reconciliation_timeout_ms() -> u64 {
    500
}

impl Default for StateRegistryConfig {
    fn default() -> Self {
        Self {
            check_sum_buffer_ms: default_check_sum_buffer_ms(),
            state_reconciliation_timeout_ms: default_state_reconciliation_timeout_ms(),
        }
    }
}

impl StateRegistryConfig {
    pub fn check_sum_buffer(&self) -> Duration {
        Duration::from_millis(self.check_sum_buffer_ms)
    }

    pub fn state_reconciliation_timeout(&self) -> Duration {
        Duration::from_millis(self.state_reconciliation_timeout_ms)
    }
}

/// Compiled storage-exclusion matcher.
#[derive(Debug, Clone, Default)]
pub struct StorageExclusion {
    pattern: Option<Regex>,
}

impl StorageExclusion {
    pub fn new(pattern: Option<&str>) -> Result<Self> {
        let pattern = match pattern.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => Some(Regex::new(value).map_err(|error| {
                RillError::Config(format!("invalid storage_exclusion '{}': {}", value, error))
            })?),
            None => None,
        };
        Ok(Self { pattern })
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(name))
    }
}
