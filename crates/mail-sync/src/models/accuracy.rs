//! Accuracy ranges: which time spans are known to mirror the server

use serde::{Deserialize, Serialize};

/// A time span `[start_ts, end_ts)` that was synchronized at `synced_at`.
///
/// With `full_sync` set, every message the server had in the span at
/// `synced_at` is present locally, less any deleted since.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracyRange {
    pub start_ts: i64,
    pub end_ts: i64,
    pub full_sync: bool,
    pub synced_at: i64,
    /// Server change marker (IMAP HIGHESTMODSEQ, ActiveSync SyncKey)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl AccuracyRange {
    pub fn overlaps(&self, start_ts: i64, end_ts: i64) -> bool {
        self.start_ts < end_ts && start_ts < self.end_ts
    }

    /// Same sync as `other`, so the two can be merged when adjacent
    pub fn same_sync_as(&self, other: &AccuracyRange) -> bool {
        self.full_sync == other.full_sync
            && self.synced_at == other.synced_at
            && self.sync_token == other.sync_token
    }
}
