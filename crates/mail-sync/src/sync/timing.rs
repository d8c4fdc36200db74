//! Freshness thresholds and window step sizes
//!
//! Pure functions that can be tested without a folder or a server.

use crate::config::SyncConfig;
use crate::date::DAY_MILLIS;
use crate::models::FolderMeta;

/// Check if data synced at `synced_at` is older than `threshold_ms`.
///
/// # Arguments
/// * `synced_at` - When the data was last synced (None if never synced)
/// * `threshold_ms` - How old data may get before it counts as stale
/// * `now` - Current time in milliseconds
///
/// # Returns
/// `true` if the data is stale (or was never synced)
pub fn is_stale(synced_at: Option<i64>, threshold_ms: i64, now: i64) -> bool {
    match synced_at {
        Some(at) => now - at > threshold_ms,
        None => true,
    }
}

/// How old stored data may be before opening a view over it refreshes it.
///
/// The inbox is held to the tightest threshold. Other folders whose newest
/// message is old enough are assumed to change rarely.
pub fn refresh_threshold(
    folder: &FolderMeta,
    newest_message: Option<i64>,
    config: &SyncConfig,
    now: i64,
) -> i64 {
    if folder.is_inbox() {
        config.refresh_inbox_ms
    } else if newest_message.is_some_and(|ts| ts <= now - config.old_is_safe_ms) {
        config.refresh_old_ms
    } else {
        config.refresh_non_inbox_ms
    }
}

/// How old stored data may be before its date range stops being a useful
/// guide for how far back to sync
pub fn known_range_threshold(folder: &FolderMeta, config: &SyncConfig) -> i64 {
    if folder.is_inbox() {
        config.known_range_inbox_ms
    } else {
        config.known_range_non_inbox_ms
    }
}

/// Largest day step allowed when a deepening sync is `days_in_past` days
/// back from today. Far in the past, mail is sparse and steps grow.
pub fn deepening_day_cap(days_in_past: f64) -> i64 {
    if days_in_past < 180.0 {
        14
    } else if days_in_past < 365.0 {
        30
    } else if days_in_past < 730.0 {
        60
    } else if days_in_past < 1095.0 {
        90
    } else if days_in_past < 1825.0 {
        120
    } else if days_in_past < 3650.0 {
        365
    } else {
        730
    }
}

/// Day step for the next deepening pass after one that found nothing
pub fn grown_day_step(cur_step: i64, days_in_past: f64, config: &SyncConfig) -> i64 {
    let grown = (cur_step as f64 * config.time_scale_factor_on_no_messages).ceil() as i64;
    grown.min(deepening_day_cap(days_in_past)).max(1)
}

/// Day step for a narrowed window after a search returned `num_headers`
/// ids over `cur_days_delta` days.
///
/// Assumes messages are spread evenly but overestimates their density by
/// two so the narrowed window undershoots the limit, and always shrinks by
/// at least one day.
pub fn bisect_day_step(
    bisect_limit: usize,
    num_headers: usize,
    cur_days_delta: i64,
    config: &SyncConfig,
) -> i64 {
    let delta = if cur_days_delta > config.max_bisect_span_days {
        config.bisect_fallback_days
    } else {
        cur_days_delta
    };
    let shrink_scale = bisect_limit as f64 / (num_headers.max(1) * 2) as f64;
    let step = (shrink_scale * delta as f64).ceil() as i64;
    step.min(delta - 2).max(1)
}

/// Whole (possibly fractional) days between `ts` and `today`
pub fn days_in_past(ts: i64, today: i64) -> f64 {
    (today - ts) as f64 / DAY_MILLIS as f64
}
