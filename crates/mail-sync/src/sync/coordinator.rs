//! One pass of synchronizing a date window with the server
//!
//! A pass searches the window, narrows it while the search returns more ids
//! than the bisection limit, then reconciles the stored messages against the
//! ids the server reported:
//! - ids only the server has are new: fetched in full and stored
//! - ids only storage has were deleted on the server
//! - ids both have are known: their flags are checked
//!
//! Every network call of a pass happens before storage is touched, so a
//! failed pass leaves storage and the accuracy ranges as they were.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use super::connection::{ConnectionError, FetchedMessage, FolderConnection, RemoteFlags};
use super::timing;
use crate::config::SyncConfig;
use crate::date::{DateWindow, days_between, make_days_before};
use crate::models::{BodyInfo, HeaderInfo, ServerId};
use crate::storage::FolderStorage;

/// Where a pass currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Searching,
    Reconciling,
    Bisecting,
    Done,
}

/// A search returned too many ids and the window is being narrowed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BisectInfo {
    pub old_window: DateWindow,
    pub new_window: DateWindow,
    /// Ids the search of `old_window` returned
    pub num_headers: usize,
    pub cur_days_delta: i64,
    /// Days the narrowed window spans
    pub day_step: i64,
}

/// What the caller wants done about a bisection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BisectDecision {
    Continue,
    Abort,
}

/// Statistics from a completed pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// The window that was actually synced, after any narrowing
    pub window: DateWindow,
    /// Messages stored for the first time
    pub new_count: usize,
    /// Messages already stored
    pub known_count: usize,
    /// Stored messages the server no longer has
    pub deleted_count: usize,
    /// Known messages whose flags changed
    pub flags_updated: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    /// True if the server had anything in the window
    pub fn saw_messages(&self) -> bool {
        self.new_count + self.known_count > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Synced(SyncReport),
    /// The caller stopped a bisection; nothing was stored or marked synced
    Aborted(BisectInfo),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The server kept rejecting our state after a reset
    #[error("server and local state disagree: {0}")]
    Desync(String),
    #[error("illegal sync window [{start}, {end})")]
    IllegalWindow { start: i64, end: i64 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Runs passes for one folder. `accuracy_stamp` is recorded as the sync time
/// of every window the coordinator marks synced.
pub struct SyncCoordinator {
    config: SyncConfig,
    bisect_limit: usize,
    accuracy_stamp: i64,
    state: SyncState,
}

impl SyncCoordinator {
    pub fn new(config: &SyncConfig, accuracy_stamp: i64) -> Self {
        Self {
            config: config.clone(),
            bisect_limit: config.bisect_limit,
            accuracy_stamp,
            state: SyncState::Idle,
        }
    }

    pub fn with_bisect_limit(mut self, bisect_limit: usize) -> Self {
        self.bisect_limit = bisect_limit;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Synchronize `window` with the server.
    ///
    /// `on_bisect` hears about every narrowing and may abort the pass. If the
    /// server rejects our sync state, the window's accuracy is discarded and
    /// the pass is run once more from scratch.
    pub fn sync_date_range(
        &mut self,
        storage: &mut FolderStorage,
        conn: &mut dyn FolderConnection,
        window: DateWindow,
        on_bisect: &mut dyn FnMut(&BisectInfo) -> BisectDecision,
    ) -> Result<PassOutcome, SyncError> {
        match self.run_pass(storage, conn, window, on_bisect) {
            Err(SyncError::Connection(ConnectionError::BadSyncState(reason))) => {
                let start = window.effective_start();
                let end = window.effective_end(self.accuracy_stamp);
                log::warn!(
                    "{} rejected sync state for {} ({}); resyncing from scratch",
                    storage.folder_id(),
                    window,
                    reason
                );
                storage.discard_sync_range(start, end);
                match self.run_pass(storage, conn, window, on_bisect) {
                    Err(SyncError::Connection(ConnectionError::BadSyncState(reason))) => {
                        self.state = SyncState::Idle;
                        Err(SyncError::Desync(reason))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    fn run_pass(
        &mut self,
        storage: &mut FolderStorage,
        conn: &mut dyn FolderConnection,
        window: DateWindow,
        on_bisect: &mut dyn FnMut(&BisectInfo) -> BisectDecision,
    ) -> Result<PassOutcome, SyncError> {
        let started = Instant::now();
        let mut window = window;

        // 1. Search, narrowing the window until the server's answer fits
        let ids = loop {
            let start = window.effective_start();
            let end = window.effective_end(self.accuracy_stamp);
            if start >= end {
                self.state = SyncState::Idle;
                return Err(SyncError::IllegalWindow { start, end });
            }

            self.state = SyncState::Searching;
            let ids = conn.search(&window).inspect_err(|_| self.state = SyncState::Idle)?;
            log::debug!("Search of {} in {} found {} ids", window, storage.folder_id(), ids.len());
            if ids.len() <= self.bisect_limit {
                break ids;
            }

            let cur_days_delta = days_between(start, end);
            if cur_days_delta <= 1 {
                log::info!(
                    "{} ids in a single day of {}; syncing them all",
                    ids.len(),
                    storage.folder_id()
                );
                break ids;
            }

            self.state = SyncState::Bisecting;
            let day_step = timing::bisect_day_step(self.bisect_limit, ids.len(), cur_days_delta, &self.config);
            let new_window = DateWindow::new(Some(make_days_before(end, day_step)), window.end);
            let info = BisectInfo {
                old_window: window,
                new_window,
                num_headers: ids.len(),
                cur_days_delta,
                day_step,
            };
            log::info!(
                "Bisecting {}: {} ids over {} days, narrowing {} to {}",
                storage.folder_id(),
                ids.len(),
                cur_days_delta,
                window,
                new_window
            );
            if on_bisect(&info) == BisectDecision::Abort {
                log::info!("Bisection of {} aborted by caller", storage.folder_id());
                self.state = SyncState::Done;
                return Ok(PassOutcome::Aborted(info));
            }
            window = new_window;
        };

        // 2. Reconcile against what storage has for the final window
        self.state = SyncState::Reconciling;
        let mut report = self
            .reconcile(storage, conn, window, ids)
            .inspect_err(|_| self.state = SyncState::Idle)?;

        // 3. Only durable data may be declared synced
        let start = window.effective_start();
        let end = window.effective_end(self.accuracy_stamp);
        let token = conn.sync_token();
        let stamp = self.accuracy_stamp;
        storage
            .run_after_deferred_calls(|s| s.mark_sync_range(start, end, token, stamp))
            .and_then(|()| storage.flush(stamp))
            .inspect_err(|_| self.state = SyncState::Idle)?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "Synced {} of {}: {} new, {} known, {} deleted in {}ms",
            window,
            storage.folder_id(),
            report.new_count,
            report.known_count,
            report.deleted_count,
            report.duration_ms
        );
        self.state = SyncState::Done;
        Ok(PassOutcome::Synced(report))
    }

    fn reconcile(
        &mut self,
        storage: &mut FolderStorage,
        conn: &mut dyn FolderConnection,
        window: DateWindow,
        ids: Vec<ServerId>,
    ) -> Result<SyncReport, SyncError> {
        let local = storage.get_all_messages_in_date_range(window.start, window.end)?;
        let mut local_by_server_id: HashMap<ServerId, HeaderInfo> = HashMap::with_capacity(local.len());
        // Extra copies of one server message; only one copy is kept
        let mut duplicates: Vec<HeaderInfo> = Vec::new();
        for header in local {
            if let Some(dup) = local_by_server_id.insert(header.server_id.clone(), header) {
                log::warn!("Server id {} stored twice in {}", dup.server_id, storage.folder_id());
                duplicates.push(dup);
            }
        }
        let remote: HashSet<&ServerId> = ids.iter().collect();

        let new_ids: Vec<ServerId> = ids
            .iter()
            .filter(|id| !local_by_server_id.contains_key(*id))
            .cloned()
            .collect();
        let known_ids: Vec<ServerId> = ids
            .iter()
            .filter(|id| local_by_server_id.contains_key(*id))
            .cloned()
            .collect();
        let deleted: Vec<HeaderInfo> = local_by_server_id
            .values()
            .filter(|h| !remote.contains(&h.server_id))
            .cloned()
            .collect();

        // Network first
        let mut fetched: Vec<FetchedMessage> = if new_ids.is_empty() {
            Vec::new()
        } else {
            conn.fetch_full(&new_ids)?
        };
        let flags: Vec<RemoteFlags> = if known_ids.is_empty() {
            Vec::new()
        } else {
            conn.fetch_flags(&known_ids)?
        };

        let mut report = SyncReport {
            window,
            known_count: known_ids.len(),
            ..SyncReport::default()
        };

        for header in deleted.iter().chain(&duplicates) {
            storage.delete_message_header_and_body(header.date, header.id)?;
            report.deleted_count += 1;
        }

        // Newest first, so a full slice drops the oldest arrivals
        fetched.sort_by(|a, b| b.header.date.cmp(&a.header.date));
        for message in fetched {
            let id = storage.allocate_header_id();
            let date = message.header.date;
            storage.add_message_header(HeaderInfo::from_remote(id, message.header))?;
            storage.add_message_body(BodyInfo::from_remote(id, date, message.body))?;
            report.new_count += 1;
        }

        let mut flags_by_id: HashMap<ServerId, RemoteFlags> =
            flags.into_iter().map(|f| (f.server_id.clone(), f)).collect();
        for server_id in &known_ids {
            let Some(header) = local_by_server_id.get(server_id) else {
                continue;
            };
            let Some(remote) = flags_by_id.remove(server_id) else {
                storage.unchanged_message_header(header);
                continue;
            };
            let merged = storage.reconcile_flags(header.id, &remote.flags);
            if merged == header.flags {
                storage.unchanged_message_header(header);
            } else {
                storage.update_message_header(header.date, header.id, |h| {
                    h.flags = merged;
                    true
                })?;
                report.flags_updated += 1;
            }
        }
        Ok(report)
    }
}
