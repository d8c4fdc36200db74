//! A folder with its server connection: the entry point for views
//!
//! `MailFolder` owns a folder's storage and its connection. Slice operations
//! ask storage what they need, run any sync that storage requests, and turn
//! a failed sync into a `SyncFailed` status on the slice.

use anyhow::Result;
use std::sync::Arc;

use crate::actions::ActionHandler;
use crate::config::SyncSettings;
use crate::date::{DateWindow, make_days_ago, now_ms};
use crate::models::FolderMeta;
use crate::slice::{GrowDirection, SliceConsumer, SliceId};
use crate::storage::{FolderStorage, MailDb, SyncRequest};
use crate::sync::{
    BisectDecision, BisectInfo, FolderConnection, FolderSyncer, PassOutcome, SyncCoordinator,
    SyncError, SyncReport,
};

pub struct MailFolder<C: FolderConnection> {
    storage: FolderStorage,
    conn: C,
    syncer: FolderSyncer,
    online: bool,
    clock: fn() -> i64,
}

impl<C: FolderConnection> MailFolder<C> {
    /// Open a folder's storage and attach its connection
    pub fn open(meta: FolderMeta, db: Arc<dyn MailDb>, settings: &SyncSettings, conn: C) -> Result<Self> {
        let storage = FolderStorage::open(meta, db, settings)?;
        Ok(Self::from_storage(storage, conn))
    }

    pub fn from_storage(storage: FolderStorage, conn: C) -> Self {
        let syncer = FolderSyncer::new(storage.sync_config());
        Self {
            storage,
            conn,
            syncer,
            online: true,
            clock: now_ms,
        }
    }

    pub fn with_bisect_limit(mut self, bisect_limit: usize) -> Self {
        self.syncer = FolderSyncer::new(self.storage.sync_config()).with_bisect_limit(bisect_limit);
        self
    }

    /// Use a different time source, e.g. a fixed one in tests
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(&self) -> &FolderStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut FolderStorage {
        &mut self.storage
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// While offline, slices are served from storage only
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Local flag edits on this folder's messages
    pub fn actions(&mut self) -> ActionHandler<'_> {
        ActionHandler::new(&mut self.storage)
    }

    /// Open a slice at 'now', syncing as much as it needs
    pub fn open_slice_from_now(
        &mut self,
        consumer: Box<dyn SliceConsumer>,
        days_desired: Option<i64>,
        force_deepening: bool,
    ) -> Result<SliceId, SyncError> {
        let now = (self.clock)();
        let (id, request) =
            self.storage
                .slice_open_from_now(consumer, days_desired, force_deepening, self.online, now)?;
        self.run_requests(request)?;
        Ok(id)
    }

    /// Open a slice at the newest stored message
    pub fn open_slice_most_recent(
        &mut self,
        consumer: Box<dyn SliceConsumer>,
        force_server: bool,
    ) -> Result<SliceId, SyncError> {
        let now = (self.clock)();
        let (id, request) = self
            .storage
            .slice_open_most_recent(consumer, force_server, self.online, now)?;
        self.run_requests(request)?;
        Ok(id)
    }

    pub fn grow_slice(
        &mut self,
        id: SliceId,
        direction: GrowDirection,
        count: usize,
        user_requested: bool,
    ) -> Result<(), SyncError> {
        let now = (self.clock)();
        let request = self
            .storage
            .grow_slice(id, direction, count, user_requested, self.online, now)?;
        self.run_requests(request)
    }

    /// Check the span a slice shows against the server
    pub fn refresh_slice(&mut self, id: SliceId) -> Result<(), SyncError> {
        if !self.online {
            log::debug!("Offline; not refreshing {}", id);
            return Ok(());
        }
        let now = (self.clock)();
        let request = self.storage.refresh_slice(id, now)?;
        self.run_requests(request)
    }

    pub fn note_ranges(&mut self, id: SliceId, first_index: usize, first_id: u64, last_index: usize, last_id: u64) {
        self.storage
            .slice_note_ranges(id, first_index, first_id, last_index, last_id);
    }

    pub fn kill_slice(&mut self, id: SliceId) {
        self.storage.kill_slice(id);
    }

    /// Sync the most recent days of the folder without a slice
    pub fn sync_recent(&mut self) -> Result<SyncReport, SyncError> {
        let now = (self.clock)();
        let config = self.storage.sync_config().clone();
        let window = DateWindow::since(make_days_ago(now, config.initial_sync_days));
        let mut coordinator = SyncCoordinator::new(&config, now);
        let outcome = coordinator.sync_date_range(&mut self.storage, &mut self.conn, window, &mut |_: &BisectInfo| {
            BisectDecision::Continue
        })?;
        match outcome {
            PassOutcome::Synced(report) => Ok(report),
            PassOutcome::Aborted(info) => Err(SyncError::Desync(format!(
                "sync of {} aborted while bisecting",
                info.old_window
            ))),
        }
    }

    fn run_requests(&mut self, mut request: Option<SyncRequest>) -> Result<(), SyncError> {
        while let Some(current) = request {
            let now = (self.clock)();
            match self.syncer.run(&mut self.storage, &mut self.conn, &current, now) {
                Ok(next) => request = next,
                Err(err) => {
                    log::warn!(
                        "Sync for {} on {} failed: {}",
                        current.slice_id,
                        self.storage.folder_id(),
                        err
                    );
                    self.storage.slice_sync_failed(current.slice_id);
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::HOUR_MILLIS;
    use crate::models::{FolderType, flags};
    use crate::slice::{BufferedConsumer, SliceStatus};
    use crate::storage::InMemoryMailDb;
    use crate::sync::{ConnectionError, FakeFolderConnection, FakeOp};

    /// 2024-03-09T12:00:00Z
    const NOW: i64 = 1_709_985_600_000;

    fn fixed_now() -> i64 {
        NOW
    }

    fn make_folder(conn: FakeFolderConnection) -> MailFolder<FakeFolderConnection> {
        let meta = FolderMeta::new("inbox", "Inbox", FolderType::Inbox);
        MailFolder::open(meta, Arc::new(InMemoryMailDb::new()), &SyncSettings::default(), conn)
            .unwrap()
            .with_clock(fixed_now)
    }

    fn server_with(count: i64) -> FakeFolderConnection {
        let mut conn = FakeFolderConnection::new();
        for i in 0..count {
            conn.add_message(NOW - (i + 1) * HOUR_MILLIS);
        }
        conn
    }

    #[test]
    fn test_open_syncs_and_shows() {
        let mut folder = make_folder(server_with(20));
        let consumer = BufferedConsumer::new();
        let id = folder
            .open_slice_from_now(Box::new(consumer.clone()), None, false)
            .unwrap();

        assert_eq!(folder.storage().slice(id).unwrap().len(), 15);
        assert_eq!(consumer.mirror().len(), 15);
        assert_eq!(consumer.last_status(), Some(SliceStatus::Synced));
    }

    #[test]
    fn test_failed_sync_reports_and_keeps_slice() {
        let mut folder = make_folder(server_with(5));
        let consumer = BufferedConsumer::new();
        let id = folder
            .open_slice_from_now(Box::new(consumer.clone()), None, false)
            .unwrap();
        let shown = consumer.mirror();

        folder
            .connection_mut()
            .fail_next(FakeOp::Search, ConnectionError::Transient("link down".into()));
        let err = folder.refresh_slice(id).unwrap_err();
        assert!(matches!(err, SyncError::Connection(_)));
        assert_eq!(consumer.last_status(), Some(SliceStatus::SyncFailed));
        assert_eq!(consumer.mirror(), shown);

        // Retrying works
        folder.refresh_slice(id).unwrap();
        assert_eq!(consumer.last_status(), Some(SliceStatus::Synced));
    }

    #[test]
    fn test_offline_open_uses_storage_only() {
        let mut folder = make_folder(server_with(5));
        folder.set_online(false);
        let consumer = BufferedConsumer::new();
        let id = folder
            .open_slice_from_now(Box::new(consumer.clone()), None, false)
            .unwrap();
        assert!(folder.storage().slice(id).unwrap().is_empty());
        assert!(folder.connection().searches().is_empty());
        assert_eq!(consumer.last_status(), Some(SliceStatus::Synced));
    }

    #[test]
    fn test_actions_reach_open_slice() {
        let mut folder = make_folder(server_with(3));
        let consumer = BufferedConsumer::new();
        let id = folder
            .open_slice_from_now(Box::new(consumer.clone()), None, false)
            .unwrap();
        let first = folder.storage().slice(id).unwrap().headers()[0].clone();

        folder.actions().set_read(first.date, first.id, true).unwrap();
        assert!(consumer.mirror()[0].is_read());
        assert!(folder.storage().pending_flag_edits(first.id).unwrap().touches(flags::SEEN));
    }

    #[test]
    fn test_sync_recent_without_slice() {
        let mut folder = make_folder(server_with(4));
        let report = folder.sync_recent().unwrap();
        assert_eq!(report.new_count, 4);
        assert_eq!(folder.storage().known_message_count(), 4);
    }
}
