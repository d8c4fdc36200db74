//! Tunable constants for block storage and synchronization
//!
//! Both structs are immutable once a folder is opened. They are read from
//! `mail-sync.json` in the config directory when present; missing fields
//! keep their production defaults, so a settings file only needs to name
//! what it changes.

use anyhow::Result;
use ::config::ConfigDir;
use serde::{Deserialize, Serialize};

use crate::date::{DAY_MILLIS, HOUR_MILLIS};

/// Settings file name within the config directory
pub const SETTINGS_FILE: &str = "mail-sync.json";

/// Block sizing and purge policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// A block is split once its estimated size exceeds this
    pub max_block_size: usize,
    /// Estimated stored size of one header
    pub header_est_size: usize,
    /// Run the purge check after this many new body blocks
    pub purge_every_body_blocks: usize,
    /// Body blocks whose covering sync is older than this may be purged
    pub purge_stale_after_ms: i64,
    /// Hard ceiling on blocks per family; exceeding it forces a purge
    pub max_blocks_per_family: usize,
    /// Upper bound on headers returned by an unbounded iteration
    pub too_many_messages: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_block_size: 8 * 1024,
            header_est_size: 430,
            purge_every_body_blocks: 32,
            purge_stale_after_ms: 14 * DAY_MILLIS,
            max_blocks_per_family: 1024,
            too_many_messages: 2000,
        }
    }
}

/// Sync window sizing and freshness thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Headers a new slice wants before it reports itself complete
    pub initial_fill_size: usize,
    /// Days covered by the first sync of an unsynced folder
    pub initial_sync_days: i64,
    /// A search returning more ids than this narrows its window
    pub bisect_limit: usize,
    /// Day step growth after a pass that found nothing
    pub time_scale_factor_on_no_messages: f64,
    /// Windows wider than this many days bisect to a fixed step instead
    pub max_bisect_span_days: i64,
    pub bisect_fallback_days: i64,
    /// Stored inbox data younger than this is shown and then refreshed
    pub refresh_inbox_ms: i64,
    pub refresh_non_inbox_ms: i64,
    /// Folders whose newest message is older than `old_is_safe_ms` use
    /// `refresh_old_ms` instead
    pub old_is_safe_ms: i64,
    pub refresh_old_ms: i64,
    /// Stored data younger than this is resynced over its known date range
    pub known_range_inbox_ms: i64,
    pub known_range_non_inbox_ms: i64,
    /// Staleness tolerated when growing a slice into stored data
    pub grow_refresh_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_fill_size: 15,
            initial_sync_days: 3,
            bisect_limit: 50,
            time_scale_factor_on_no_messages: 1.6,
            max_bisect_span_days: 1000,
            bisect_fallback_days: 30,
            refresh_inbox_ms: 2 * HOUR_MILLIS,
            refresh_non_inbox_ms: 6 * HOUR_MILLIS,
            old_is_safe_ms: 4 * 30 * DAY_MILLIS,
            refresh_old_ms: 2 * 30 * DAY_MILLIS,
            known_range_inbox_ms: 6 * HOUR_MILLIS,
            known_range_non_inbox_ms: 7 * DAY_MILLIS,
            grow_refresh_ms: 7 * DAY_MILLIS,
        }
    }
}

/// Everything in the settings file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

impl SyncSettings {
    /// Load from the default config directory, or defaults if there is none
    pub fn load() -> Result<Self> {
        match ConfigDir::locate() {
            Some(dir) => Self::load_from(&dir),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(dir: &ConfigDir) -> Result<Self> {
        let settings: SyncSettings = dir.load_or_default(SETTINGS_FILE)?;
        log::debug!("Loaded sync settings from {}", dir.root().display());
        Ok(settings)
    }
}
