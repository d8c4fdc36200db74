//! A folder's stored messages, sync coverage and bound slices
//!
//! `FolderStorage` is the single point of mutation for a folder. Every change
//! goes through the header and body block stores and is reported to the
//! affected slices synchronously, before the call returns. Block writes are
//! buffered in dirty blocks until `flush`; `run_after_deferred_calls` runs its
//! callback only once they are durable.
//!
//! Slice routing for a stored header:
//! - the slice a sync is currently filling sees every header the sync touches
//! - other slices see changes inside their bounds, plus new messages above
//!   their newest header when that header was the newest one known

use anyhow::{Context, Result, anyhow};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::accuracy::{AccuracyTracker, RefreshGap};
use super::block_store::BlockStore;
use super::invariant::violation;
use super::{FlushBatch, MailDb};
use crate::config::{StorageConfig, SyncConfig, SyncSettings};
use crate::date::{DAY_MILLIS, DateWindow, OLDEST_SYNC_DATE, make_days_ago, make_days_before, quantize_date, tomorrow};
use crate::models::{
    BodyInfo, FolderMeta, HeaderInfo, Keyed, PendingFlagEdits, PersistedFolderInfo, SortKey,
};
use crate::slice::{GrowDirection, MailSlice, SliceConsumer, SliceFlags, SliceId, SliceStatus};
use crate::sync::timing;

/// How a requested sync should be run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Re-check what a slice already shows. Overflowing the bisection limit
    /// aborts it in favour of a fresh sync from now.
    Refresh,
    /// Sync the window, then keep stepping into the past while the slice
    /// wants more headers
    Deepen { accumulate: bool },
    /// Sync exactly the window and stop
    Limited,
}

/// A sync a slice operation needs before it can complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub slice_id: SliceId,
    pub window: DateWindow,
    pub kind: SyncKind,
}

pub struct FolderStorage {
    meta: FolderMeta,
    db: Arc<dyn MailDb>,
    storage_config: StorageConfig,
    sync_config: SyncConfig,
    headers: BlockStore<HeaderInfo>,
    bodies: BlockStore<BodyInfo>,
    accuracy: AccuracyTracker,
    next_header_id: u64,
    /// Accuracy ranges or the id counter changed since the last flush
    info_dirty: bool,
    slices: Vec<MailSlice>,
    next_slice_id: u64,
    /// The slice a deepening or limited sync is filling
    cur_sync_slice: Option<SliceId>,
    pending_flags: HashMap<u64, PendingFlagEdits>,
    body_blocks_since_purge: usize,
    purge_due: bool,
}

impl FolderStorage {
    /// Open a folder, loading its persisted state if it has any
    pub fn open(meta: FolderMeta, db: Arc<dyn MailDb>, settings: &SyncSettings) -> Result<Self> {
        let info = db
            .load_folder_info(&meta.id)
            .with_context(|| format!("Failed to load folder info for {}", meta.id))?;
        match &info {
            Some(info) => log::debug!(
                "Opened folder {}: {} header blocks, {} body blocks, {} accuracy ranges",
                meta.id,
                info.header_block_index.len(),
                info.body_block_index.len(),
                info.accuracy_ranges.len()
            ),
            None => log::debug!("Opened new folder {}", meta.id),
        }
        Ok(Self::with_info(meta, db, settings, info.unwrap_or_default()))
    }

    pub fn with_info(
        meta: FolderMeta,
        db: Arc<dyn MailDb>,
        settings: &SyncSettings,
        info: PersistedFolderInfo,
    ) -> Self {
        let headers = BlockStore::new(
            meta.id.clone(),
            db.clone(),
            settings.storage.clone(),
            info.header_block_index,
        );
        let bodies = BlockStore::new(
            meta.id.clone(),
            db.clone(),
            settings.storage.clone(),
            info.body_block_index,
        );
        Self {
            meta,
            db,
            storage_config: settings.storage.clone(),
            sync_config: settings.sync.clone(),
            headers,
            bodies,
            accuracy: AccuracyTracker::new(info.accuracy_ranges),
            next_header_id: info.next_header_id,
            info_dirty: false,
            slices: Vec::new(),
            next_slice_id: 0,
            cur_sync_slice: None,
            pending_flags: HashMap::new(),
            body_blocks_since_purge: 0,
            purge_due: false,
        }
    }

    pub fn meta(&self) -> &FolderMeta {
        &self.meta
    }

    pub fn folder_id(&self) -> &str {
        &self.meta.id
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync_config
    }

    pub fn storage_config(&self) -> &StorageConfig {
        &self.storage_config
    }

    pub fn accuracy(&self) -> &AccuracyTracker {
        &self.accuracy
    }

    pub fn header_block_count(&self) -> usize {
        self.headers.block_count()
    }

    pub fn body_block_count(&self) -> usize {
        self.bodies.block_count()
    }

    // -- Mutation

    /// Hand out the next local header id
    pub fn allocate_header_id(&mut self) -> u64 {
        let id = self.next_header_id;
        self.next_header_id += 1;
        self.info_dirty = true;
        id
    }

    /// Store a new header and show it to the slices it belongs in
    pub fn add_message_header(&mut self, header: HeaderInfo) -> Result<()> {
        let key = header.sort_key();
        let youngest_before = self.headers.youngest_key();
        self.headers.insert(header.clone())?;
        if self.headers.block_count() > self.storage_config.max_blocks_per_family {
            self.purge_due = true;
        }
        if header.id >= self.next_header_id {
            self.next_header_id = header.id + 1;
            self.info_dirty = true;
        }
        log::debug!("Added header {} ({}) to {}", header.id, header.server_id, self.meta.id);

        let cur = self.cur_sync_slice;
        for slice in &mut self.slices {
            if Some(slice.id()) == cur {
                slice.on_header_added(&header, true);
            } else if accepts_passive_add(slice, key, youngest_before) {
                slice.on_header_added(&header, false);
            }
        }
        Ok(())
    }

    /// Store the body of a header that is already stored
    pub fn add_message_body(&mut self, body: BodyInfo) -> Result<()> {
        let key = body.sort_key();
        if self.headers.get(key)?.is_none() {
            return Err(violation(format!(
                "body {:?} added to {} without its header",
                key, self.meta.id
            )));
        }
        self.bodies.insert(body)?;

        self.body_blocks_since_purge += self.bodies.take_blocks_created();
        if self.body_blocks_since_purge >= self.storage_config.purge_every_body_blocks {
            self.body_blocks_since_purge = 0;
            self.purge_due = true;
        }
        Ok(())
    }

    /// Mutate a stored header. `mutate` returns whether it changed anything.
    ///
    /// Returns false when nothing changed or the header isn't stored.
    pub fn update_message_header<F>(&mut self, date: i64, id: u64, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut HeaderInfo) -> bool,
    {
        let key = SortKey::new(date, id);
        match self.headers.update(key, mutate)? {
            None => {
                log::warn!("No header {:?} in {} to update", key, self.meta.id);
                Ok(false)
            }
            Some(false) => Ok(false),
            Some(true) => {
                if let Some(header) = self.headers.get(key)? {
                    self.notify_modified(&header);
                }
                Ok(true)
            }
        }
    }

    /// Replace a stored header wholesale; its date and id must not change
    pub fn replace_message_header(&mut self, header: HeaderInfo) -> Result<bool> {
        let (date, id) = (header.date, header.id);
        self.update_message_header(date, id, |stored| {
            if *stored == header {
                return false;
            }
            *stored = header;
            true
        })
    }

    /// A sync saw a header it already had, unchanged. The slice being
    /// filled by that sync still needs to hear about it.
    pub fn unchanged_message_header(&mut self, header: &HeaderInfo) {
        if let Some(cur) = self.cur_sync_slice
            && let Some(slice) = self.slice_mut(cur)
        {
            slice.on_header_added(header, true);
        }
    }

    pub fn update_message_body<F>(&mut self, date: i64, id: u64, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut BodyInfo) -> bool,
    {
        Ok(self.bodies.update(SortKey::new(date, id), mutate)?.unwrap_or(false))
    }

    /// Delete a message. The header must be stored; the body may lag.
    pub fn delete_message_header_and_body(&mut self, date: i64, id: u64) -> Result<HeaderInfo> {
        let key = SortKey::new(date, id);
        let header = self.headers.remove(key)?;
        self.bodies.remove_if_present(key)?;
        self.pending_flags.remove(&id);
        log::debug!("Deleted message {} ({}) from {}", id, header.server_id, self.meta.id);
        self.notify_removed(&header);
        Ok(header)
    }

    fn notify_modified(&mut self, header: &HeaderInfo) {
        let key = header.sort_key();
        let cur = self.cur_sync_slice;
        for slice in &mut self.slices {
            if Some(slice.id()) == cur {
                // A filling slice may not hold it yet
                slice.on_header_added(header, true);
            } else if slice.covers(key) {
                slice.on_header_modified(header);
            }
        }
    }

    fn notify_removed(&mut self, header: &HeaderInfo) {
        let key = header.sort_key();
        let cur = self.cur_sync_slice;
        for slice in &mut self.slices {
            if Some(slice.id()) == cur || slice.covers(key) {
                slice.on_header_removed(header);
            }
        }
    }

    // -- Local flag edits

    /// Set or clear a flag locally, remembering the edit until the server
    /// reflects it
    pub fn set_local_flag(&mut self, date: i64, id: u64, flag: &str, on: bool) -> Result<bool> {
        if self.headers.get(SortKey::new(date, id))?.is_none() {
            return Err(anyhow!("No message {} in {}", id, self.meta.id));
        }
        let changed = self.update_message_header(date, id, |header| {
            if on {
                header.flags.insert(flag.to_string())
            } else {
                header.flags.remove(flag)
            }
        })?;
        self.pending_flags.entry(id).or_default().record(flag, on);
        Ok(changed)
    }

    /// Forget a local edit, e.g. after the server accepted it
    pub fn acknowledge_flag(&mut self, id: u64, flag: &str) {
        if let Some(edits) = self.pending_flags.get_mut(&id) {
            edits.acknowledge(flag);
            if edits.is_empty() {
                self.pending_flags.remove(&id);
            }
        }
    }

    pub fn pending_flag_edits(&self, id: u64) -> Option<&PendingFlagEdits> {
        self.pending_flags.get(&id)
    }

    /// Flags a stored header should have given what the server reports.
    ///
    /// Edits the server now agrees with are dropped.
    pub fn reconcile_flags(&mut self, id: u64, remote: &BTreeSet<String>) -> BTreeSet<String> {
        let Some(edits) = self.pending_flags.get_mut(&id) else {
            return remote.clone();
        };
        let merged = edits.reconcile(remote);
        edits.prune_applied(remote);
        if edits.is_empty() {
            self.pending_flags.remove(&id);
        }
        merged
    }

    // -- Queries

    pub fn get_message_header(&mut self, date: i64, id: u64) -> Result<Option<HeaderInfo>> {
        self.headers.get(SortKey::new(date, id))
    }

    pub fn get_message_body(&mut self, date: i64, id: u64) -> Result<Option<BodyInfo>> {
        self.bodies.get(SortKey::new(date, id))
    }

    /// Headers dated within `[start, end)`, newest first, at most `limit`
    /// (by default the too-many-messages cap)
    pub fn get_messages_in_date_range(
        &mut self,
        start: Option<i64>,
        end: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<HeaderInfo>> {
        let limit = limit.unwrap_or(self.storage_config.too_many_messages);
        self.headers.range(start, end, limit)
    }

    /// Every header dated within `[start, end)`, uncapped
    pub fn get_all_messages_in_date_range(
        &mut self,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<HeaderInfo>> {
        self.headers.range(start, end, usize::MAX)
    }

    /// Up to `limit` headers older than `key`, newest first. None starts
    /// from the newest header.
    pub fn get_messages_before_message(
        &mut self,
        key: Option<SortKey>,
        limit: usize,
    ) -> Result<Vec<HeaderInfo>> {
        match key {
            None => self.headers.range(None, None, limit),
            Some(key) => {
                if self.headers.get(key)?.is_none() {
                    log::warn!("Iterating {} from unknown header {:?}", self.meta.id, key);
                }
                self.headers.older_than(key, limit)
            }
        }
    }

    /// Up to `limit` headers newer than `key`, newest first
    pub fn get_messages_after_message(&mut self, key: SortKey, limit: usize) -> Result<Vec<HeaderInfo>> {
        if self.headers.get(key)?.is_none() {
            log::warn!("Iterating {} from unknown header {:?}", self.meta.id, key);
        }
        self.headers.newer_than(key, limit)
    }

    pub fn header_is_youngest_known(&self, key: SortKey) -> bool {
        self.headers.youngest_key() == Some(key)
    }

    pub fn header_is_oldest_known(&self, key: SortKey) -> bool {
        self.headers.oldest_key() == Some(key)
    }

    /// Date of the newest stored message
    pub fn youngest_message_date(&self) -> Option<i64> {
        self.headers.youngest_key().map(|key| key.date)
    }

    pub fn known_message_count(&self) -> usize {
        self.headers.entry_count()
    }

    pub fn oldest_full_sync_date(&self) -> Option<i64> {
        self.accuracy.oldest_full_sync_date()
    }

    pub fn synced_to_dawn_of_time(&self) -> bool {
        self.accuracy.synced_to_dawn_of_time()
    }

    pub fn needs_refresh(&self, start: i64, end: i64, stale_ms: i64, now: i64) -> Option<RefreshGap> {
        self.accuracy.needs_refresh_at(start, end, stale_ms, now)
    }

    // -- Accuracy

    /// Record a completed full sync of `[start, end)`
    pub fn mark_sync_range(&mut self, start: i64, end: i64, sync_token: Option<String>, synced_at: i64) {
        self.accuracy.mark_synced(start, end, true, synced_at, sync_token);
        self.info_dirty = true;
    }

    /// Everything the server has is stored: nothing older is left to find
    pub fn mark_synced_entire_folder(&mut self, now: i64) {
        log::info!("Folder {} is synced to the dawn of time", self.meta.id);
        self.accuracy.mark_synced_to_dawn_of_time(now);
        self.info_dirty = true;
    }

    /// Forget what is known about `[start, end)` after the server rejected
    /// our sync state
    pub fn discard_sync_range(&mut self, start: i64, end: i64) {
        self.accuracy.discard(start, end);
        self.info_dirty = true;
    }

    // -- Slices

    pub fn slice(&self, id: SliceId) -> Option<&MailSlice> {
        self.slices.iter().find(|s| s.id() == id)
    }

    fn slice_mut(&mut self, id: SliceId) -> Option<&mut MailSlice> {
        self.slices.iter_mut().find(|s| s.id() == id)
    }

    pub fn slice_ids(&self) -> Vec<SliceId> {
        self.slices.iter().map(MailSlice::id).collect()
    }

    /// The slice a running sync is filling, if any
    pub fn cur_sync_slice(&self) -> Option<SliceId> {
        self.cur_sync_slice
    }

    fn bind_slice(&mut self, consumer: Box<dyn SliceConsumer>) -> SliceId {
        let id = SliceId(self.next_slice_id);
        self.next_slice_id += 1;
        let mut slice = MailSlice::new(id, consumer, self.sync_config.initial_fill_size);
        // New slices always start at the newest message
        slice.update_flags(SliceFlags {
            at_top: true,
            ..SliceFlags::default()
        });
        self.slices.push(slice);
        log::debug!("Bound {} to {}", id, self.meta.id);
        id
    }

    /// Bind a slice at 'now' and decide how to fill it.
    ///
    /// 1. Stored data synced within the folder's refresh threshold: show it,
    ///    then refresh the span it covers.
    /// 2. Stored data synced within the known-range threshold: resync the
    ///    span of the newest stored headers and deliver them in one batch.
    /// 3. Otherwise sync `days_desired` days back from now and deepen.
    ///
    /// Offline, stored data is shown as-is.
    pub fn slice_open_from_now(
        &mut self,
        consumer: Box<dyn SliceConsumer>,
        days_desired: Option<i64>,
        force_deepening: bool,
        online: bool,
        now: i64,
    ) -> Result<(SliceId, Option<SyncRequest>)> {
        let id = self.bind_slice(consumer);
        let days = days_desired.unwrap_or(self.sync_config.initial_sync_days);
        let plan = if online {
            self.plan_sync_from_now(days, force_deepening, now)?
        } else {
            None
        };

        let request = match plan {
            None => self.fill_from_stored(id, online, now)?,
            Some((start, accumulate)) => {
                let window = DateWindow::since(start);
                log::info!(
                    "Opening {} on {}: syncing {}{}",
                    id,
                    self.meta.id,
                    window,
                    if accumulate { " in accumulate mode" } else { "" }
                );
                self.start_slice_sync(id, accumulate);
                Some(SyncRequest {
                    slice_id: id,
                    window,
                    kind: SyncKind::Deepen { accumulate },
                })
            }
        };
        Ok((id, request))
    }

    /// None means stored data is good enough to show; otherwise the start
    /// of the window to sync and whether to accumulate
    fn plan_sync_from_now(
        &mut self,
        days: i64,
        force_deepening: bool,
        now: i64,
    ) -> Result<Option<(i64, bool)>> {
        let from_scratch = Some((make_days_ago(now, days), false));
        if force_deepening {
            return Ok(from_scratch);
        }
        let Some(newest) = self.accuracy.newest().cloned() else {
            return Ok(from_scratch);
        };
        if !newest.full_sync {
            return Ok(from_scratch);
        }

        let refresh = timing::refresh_threshold(&self.meta, self.youngest_message_date(), &self.sync_config, now);
        if !timing::is_stale(Some(newest.synced_at), refresh, now) {
            return Ok(None);
        }

        let known_range = timing::known_range_threshold(&self.meta, &self.sync_config);
        if !timing::is_stale(Some(newest.synced_at), known_range, now) {
            // The accuracy ranges may have been split by later refreshes, so
            // the headers themselves say how far back the newest batch goes
            let fill = self.sync_config.initial_fill_size.max(1);
            let recent = self.headers.range(None, None, fill)?;
            if let Some(oldest) = recent.last() {
                return Ok(Some((quantize_date(oldest.date), true)));
            }
        }
        Ok(from_scratch)
    }

    /// Fill a fresh slice from storage and optionally refresh what it shows
    fn fill_from_stored(&mut self, id: SliceId, refresh: bool, now: i64) -> Result<Option<SyncRequest>> {
        let headers = self.headers.range(None, None, self.sync_config.initial_fill_size)?;
        if let Some(slice) = self.slice_mut(id) {
            let found = headers.len();
            slice.batch_append(headers, None, refresh);
            if found > 0 {
                slice.set_desired_headers(found);
            }
        }
        self.update_slice_flags(id);

        if refresh {
            return self.refresh_slice(id, now);
        }
        if let Some(slice) = self.slice_mut(id) {
            slice.set_status(SliceStatus::Synced, true, false, false);
        }
        Ok(None)
    }

    /// Bind a slice at the newest stored message, fill it from storage and
    /// refresh it when asked to or when its span is stale
    pub fn slice_open_most_recent(
        &mut self,
        consumer: Box<dyn SliceConsumer>,
        force_server: bool,
        online: bool,
        now: i64,
    ) -> Result<(SliceId, Option<SyncRequest>)> {
        let id = self.bind_slice(consumer);

        if online && self.headers.is_empty() && self.accuracy.is_empty() {
            let window = DateWindow::since(make_days_ago(now, self.sync_config.initial_sync_days));
            log::info!("Opening {} on unsynced {}: syncing {}", id, self.meta.id, window);
            self.start_slice_sync(id, false);
            let request = SyncRequest {
                slice_id: id,
                window,
                kind: SyncKind::Deepen { accumulate: false },
            };
            return Ok((id, Some(request)));
        }

        let headers = self.headers.range(None, None, self.sync_config.initial_fill_size)?;
        let shown_start = headers.last().map(|h| quantize_date(h.date));
        if let Some(slice) = self.slice_mut(id) {
            let found = headers.len();
            slice.batch_append(headers, None, online);
            if found > 0 {
                slice.set_desired_headers(found);
            }
        }
        self.update_slice_flags(id);

        if online {
            let start = shown_start
                .or_else(|| self.accuracy.oldest_full_sync_date())
                .unwrap_or_else(|| make_days_ago(now, self.sync_config.initial_sync_days));
            let threshold =
                timing::refresh_threshold(&self.meta, self.youngest_message_date(), &self.sync_config, now);
            let stale = self.accuracy.needs_refresh_at(start, tomorrow(now), threshold, now);
            if force_server || stale.is_some() {
                return Ok((id, self.refresh_slice(id, now)?));
            }
        }
        if let Some(slice) = self.slice_mut(id) {
            slice.set_status(SliceStatus::Synced, true, false, false);
        }
        Ok((id, None))
    }

    /// Plan a refresh of the span a slice shows.
    ///
    /// A slice holding the newest known message refreshes up to now; one
    /// holding the oldest known message refreshes back to the start of the
    /// folder's contiguous full-sync coverage.
    pub fn refresh_slice(&mut self, id: SliceId, now: i64) -> Result<Option<SyncRequest>> {
        let Some(slice) = self.slice(id) else {
            return Ok(None);
        };
        let (start_key, end_key) = (slice.start_key(), slice.end_key());

        let end = match end_key {
            Some(key) if !self.header_is_youngest_known(key) => Some(quantize_date(key.date + DAY_MILLIS)),
            _ => None,
        };
        let start = match start_key {
            Some(key) if self.header_is_oldest_known(key) => self
                .accuracy
                .oldest_full_sync_date()
                .map_or(key.date, |oldest| oldest.min(key.date)),
            Some(key) => key.date,
            None => self
                .accuracy
                .oldest_full_sync_date()
                .unwrap_or_else(|| make_days_ago(now, self.sync_config.initial_sync_days)),
        };
        let window = DateWindow::new(Some(quantize_date(start)), end);

        if let Some(slice) = self.slice_mut(id) {
            slice.set_waiting_on_data(true);
            slice.set_status(SliceStatus::Synchronizing, false, true, false);
        }
        log::info!("Refreshing {} on {} over {}", id, self.meta.id, window);
        Ok(Some(SyncRequest {
            slice_id: id,
            window,
            kind: SyncKind::Refresh,
        }))
    }

    /// A refresh completed without overflowing
    pub fn finish_refresh(&mut self, id: SliceId) {
        if let Some(slice) = self.slice_mut(id) {
            slice.set_waiting_on_data(false);
            slice.set_status(SliceStatus::Synced, true, false, false);
        }
        self.update_slice_flags(id);
    }

    /// A refresh found too many messages to be a refresh. Throw the slice's
    /// content away and sync it again from now.
    pub fn refresh_exploded(&mut self, id: SliceId, now: i64) -> Option<SyncRequest> {
        let fill = self.sync_config.initial_fill_size;
        let slice = self.slice_mut(id)?;
        slice.reset_headers();
        slice.set_desired_headers(fill);
        log::info!("Refresh of {} overflowed; resyncing from now", id);

        let window = DateWindow::since(make_days_ago(now, self.sync_config.initial_sync_days));
        self.start_slice_sync(id, false);
        Some(SyncRequest {
            slice_id: id,
            window,
            kind: SyncKind::Deepen { accumulate: false },
        })
    }

    fn start_slice_sync(&mut self, id: SliceId, accumulate: bool) {
        if let Some(cur) = self.cur_sync_slice.filter(|cur| *cur != id) {
            log::warn!("Starting a sync for {} while {} is still syncing", id, cur);
        }
        let Some(slice) = self.slice_mut(id) else {
            return;
        };
        slice.set_status(SliceStatus::Synchronizing, false, true, false);
        slice.set_waiting_on_data(true);
        if accumulate && slice.is_empty() {
            slice.set_accumulating(true);
        }
        self.cur_sync_slice = Some(id);
    }

    /// A deepening or limited pass finished. Returns true if the slice wants
    /// another, older pass.
    ///
    /// `folder_message_count` is the server's message count, when it reports
    /// one. `exhausted` means no older window is left to search.
    pub fn on_sync_completed(
        &mut self,
        id: SliceId,
        folder_message_count: Option<usize>,
        limited: bool,
        exhausted: bool,
        now: i64,
    ) -> bool {
        let db_count = self.known_message_count();
        let oldest_known = self.headers.oldest_key();
        let Some((start_key, len)) = self.slice(id).map(|s| (s.start_key(), s.len())) else {
            // The slice died while its sync ran
            if self.cur_sync_slice == Some(id) {
                self.cur_sync_slice = None;
            }
            return false;
        };
        let at_oldest = start_key == oldest_known;

        if folder_message_count == Some(db_count) && at_oldest {
            // Everything the server has is stored and shown down to the oldest
            self.mark_synced_entire_folder(now);
            if let Some(slice) = self.slice_mut(id) {
                slice.set_desired_headers(len);
            }
        } else if exhausted
            || (at_oldest && self.accuracy.synced_to_dawn_of_time())
            || start_key.is_some_and(|key| key.date <= OLDEST_SYNC_DATE)
        {
            if let Some(slice) = self.slice_mut(id) {
                slice.set_desired_headers(len);
            }
        }

        let Some(slice) = self.slice_mut(id) else {
            return false;
        };
        if slice.len() >= slice.desired_headers() || limited {
            log::info!(
                "Sync for {} done: have {} headers, wanted {}",
                id,
                slice.len(),
                slice.desired_headers()
            );
            // An accumulating slice is trimmed to its desired size on release
            if !slice.is_accumulating() && !slice.is_empty() {
                let len = slice.len();
                slice.set_desired_headers(len);
            }
            slice.set_waiting_on_data(false);
            slice.set_status(SliceStatus::Synced, true, false, true);
            self.cur_sync_slice = None;
            self.update_slice_flags(id);
            false
        } else {
            if slice.is_accumulating() {
                // Show what we have and fill the rest incrementally
                slice.set_status(SliceStatus::Synchronizing, true, true, true);
            }
            true
        }
    }

    /// A sync for the slice failed. Headers it already showed stay.
    pub fn slice_sync_failed(&mut self, id: SliceId) {
        if self.cur_sync_slice == Some(id) {
            self.cur_sync_slice = None;
        }
        if let Some(slice) = self.slice_mut(id) {
            slice.discard_accumulated();
            slice.set_waiting_on_data(false);
            slice.set_status(SliceStatus::SyncFailed, true, false, false);
        }
    }

    /// Extend a slice by `count` headers.
    ///
    /// Newer headers always come from storage. Older ones come from storage
    /// when the span they cover was synced recently enough; otherwise that
    /// span is synced first. With nothing older stored, only a user request
    /// syncs further into the past.
    pub fn grow_slice(
        &mut self,
        id: SliceId,
        direction: GrowDirection,
        count: usize,
        user_requested: bool,
        online: bool,
        now: i64,
    ) -> Result<Option<SyncRequest>> {
        let Some(slice) = self.slice(id) else {
            return Ok(None);
        };
        let (start_key, end_key) = (slice.start_key(), slice.end_key());

        if direction == GrowDirection::Newer {
            let headers = match end_key {
                Some(end) => self.headers.newer_than(end, count)?,
                None => Vec::new(),
            };
            if let Some(slice) = self.slice_mut(id) {
                let desired = slice.desired_headers() + count;
                slice.set_desired_headers(desired);
                slice.batch_append(headers, Some(0), false);
            }
            self.update_slice_flags(id);
            return Ok(None);
        }

        let batch = self.get_messages_before_message(start_key, count)?;
        if !online {
            self.finish_grow_from_storage(id, batch);
            return Ok(None);
        }

        // Days are synced whole, so the slice's oldest day counts as synced
        let sync_end = quantize_date(start_key.map_or_else(|| tomorrow(now), |key| key.date));
        let sync_start = batch
            .last()
            .map(|h| quantize_date(h.date))
            .filter(|start| *start != sync_end);

        if let Some(sync_start) = sync_start {
            let fresh = self
                .accuracy
                .needs_refresh_at(sync_start, sync_end, self.sync_config.grow_refresh_ms, now)
                .is_none();
            if fresh {
                self.finish_grow_from_storage(id, batch);
                return Ok(None);
            }

            // Headers on the slice's own day won't be reported by the sync
            let first_not_to_send = batch
                .iter()
                .position(|h| h.date < sync_end)
                .unwrap_or(batch.len());
            let already_synced: Vec<HeaderInfo> = batch.into_iter().take(first_not_to_send).collect();
            if let Some(slice) = self.slice_mut(id) {
                slice.batch_append(already_synced, None, true);
                let desired = slice.desired_headers() + count;
                slice.set_desired_headers(desired);
            }
            self.start_slice_sync(id, false);
            return Ok(Some(SyncRequest {
                slice_id: id,
                window: DateWindow::between(sync_start, sync_end),
                kind: SyncKind::Limited,
            }));
        }

        if batch.is_empty() && user_requested && !self.accuracy.synced_to_dawn_of_time() {
            if let Some(slice) = self.slice_mut(id) {
                let desired = slice.desired_headers() + count;
                slice.set_desired_headers(desired);
            }
            let window = DateWindow::between(
                make_days_before(sync_end, self.sync_config.initial_sync_days),
                sync_end,
            );
            log::info!("Growing {} past stored data: syncing {}", id, window);
            self.start_slice_sync(id, false);
            return Ok(Some(SyncRequest {
                slice_id: id,
                window,
                kind: SyncKind::Deepen { accumulate: false },
            }));
        }

        self.finish_grow_from_storage(id, batch);
        Ok(None)
    }

    fn finish_grow_from_storage(&mut self, id: SliceId, batch: Vec<HeaderInfo>) {
        if let Some(slice) = self.slice_mut(id) {
            if !batch.is_empty() {
                slice.batch_append(batch, None, false);
                let len = slice.len();
                slice.set_desired_headers(len);
            }
            slice.set_status(SliceStatus::Synced, true, false, false);
        }
        self.update_slice_flags(id);
    }

    /// The consumer only shows part of the slice now; trim the rest
    pub fn slice_note_ranges(
        &mut self,
        id: SliceId,
        first_index: usize,
        first_id: u64,
        last_index: usize,
        last_id: u64,
    ) {
        if let Some(slice) = self.slice_mut(id) {
            slice.note_ranges(first_index, first_id, last_index, last_id);
        }
    }

    /// Recompute and publish where a slice sits relative to stored data
    pub fn update_slice_flags(&mut self, id: SliceId) {
        let youngest = self.headers.youngest_key();
        let oldest = self.headers.oldest_key();
        let dawn = self.accuracy.synced_to_dawn_of_time();
        let Some(slice) = self.slice_mut(id) else {
            return;
        };
        let at_oldest = slice.start_key() == oldest;
        let flags = SliceFlags {
            at_top: slice.end_key().is_none_or(|key| Some(key) == youngest),
            at_bottom: at_oldest && dawn,
            user_can_grow_downwards: at_oldest && !dawn,
        };
        if flags != slice.flags() {
            slice.update_flags(flags);
        }
    }

    /// Unbind a slice; it gets no further events
    pub fn kill_slice(&mut self, id: SliceId) {
        if let Some(idx) = self.slices.iter().position(|s| s.id() == id) {
            let mut slice = self.slices.remove(idx);
            slice.die();
            log::debug!("Killed {} on {}", id, self.meta.id);
        }
        if self.cur_sync_slice == Some(id) {
            self.cur_sync_slice = None;
        }
    }

    // -- Purge

    fn span_is_shown(&self, oldest: SortKey, newest: SortKey) -> bool {
        self.slices.iter().any(|slice| match (slice.end_key(), slice.start_key()) {
            (Some(slice_newest), Some(slice_oldest)) => slice_newest <= oldest && newest <= slice_oldest,
            _ => false,
        })
    }

    /// Drop the oldest blocks along with the entries paired with them.
    ///
    /// Either family over its block limit loses its oldest blocks first,
    /// even if a slice shows them. Below the limit, a body block goes only
    /// if its span was last synced before the staleness cutoff and no slice
    /// shows it. The purged span stays known to the accuracy ranges but no
    /// longer counts as fully synced.
    pub fn purge(&mut self, now: i64) -> Result<usize> {
        let max_blocks = self.storage_config.max_blocks_per_family;
        let stale_before = now - self.storage_config.purge_stale_after_ms;
        let mut purged = 0;

        while self.headers.block_count() > max_blocks.max(1) {
            let Some((info, headers)) = self.headers.pop_oldest()? else {
                break;
            };
            for header in &headers {
                self.bodies.remove_if_present(header.sort_key())?;
                self.pending_flags.remove(&header.id);
                self.notify_removed(header);
            }
            self.accuracy.downgrade(info.start_ts, info.end_ts + 1);
            log::info!(
                "Purged header block {} of {} with {} messages (over block limit)",
                info.block_id,
                self.meta.id,
                headers.len()
            );
            purged += 1;
        }

        while self.bodies.block_count() > 1 {
            let Some(oldest) = self.bodies.infos().last().cloned() else {
                break;
            };
            let over_limit = self.bodies.block_count() > max_blocks;
            if !over_limit {
                let synced_at = self.accuracy.last_synced_within(oldest.start_ts, oldest.end_ts + 1);
                let stale = synced_at.is_some_and(|at| at < stale_before);
                if !stale || self.span_is_shown(oldest.start_key(), oldest.end_key()) {
                    break;
                }
            }

            let Some((info, bodies)) = self.bodies.pop_oldest()? else {
                break;
            };
            let mut headers_dropped = 0;
            for body in &bodies {
                if let Some(header) = self.headers.remove_if_present(body.sort_key())? {
                    self.pending_flags.remove(&header.id);
                    self.notify_removed(&header);
                    headers_dropped += 1;
                }
            }
            self.accuracy.downgrade(info.start_ts, info.end_ts + 1);
            log::info!(
                "Purged body block {} of {} with {} messages{}",
                info.block_id,
                self.meta.id,
                headers_dropped,
                if over_limit { " (over block limit)" } else { "" }
            );
            purged += 1;
        }

        if purged > 0 {
            self.info_dirty = true;
        }
        Ok(purged)
    }

    // -- Persistence

    /// The folder state that must survive a restart
    pub fn persistence_info(&self) -> PersistedFolderInfo {
        PersistedFolderInfo {
            next_header_id: self.next_header_id,
            accuracy_ranges: self.accuracy.ranges().to_vec(),
            header_block_index: self.headers.infos().to_vec(),
            body_block_index: self.bodies.infos().to_vec(),
        }
    }

    pub fn has_unflushed_changes(&self) -> bool {
        self.info_dirty || self.headers.has_dirty_blocks() || self.bodies.has_dirty_blocks()
    }

    /// Write folder info and every dirty block in one commit.
    ///
    /// Returns the number of blocks written. On failure the blocks stay
    /// dirty so a later flush retries them.
    ///
    /// A purge that came due since the last flush runs first, judged
    /// against `now`.
    pub fn flush(&mut self, now: i64) -> Result<usize> {
        if self.purge_due {
            self.purge_due = false;
            self.purge(now)?;
        }
        self.commit()
    }

    fn commit(&mut self) -> Result<usize> {
        if !self.has_unflushed_changes() {
            return Ok(0);
        }

        let batch = FlushBatch {
            info: self.persistence_info(),
            header_blocks: self.headers.flush_dirty(),
            body_blocks: self.bodies.flush_dirty(),
        };
        let blocks = batch.block_count();
        if let Err(err) = self.db.put_blocks(&self.meta.id, &batch) {
            self.headers.requeue_dirty(batch.header_blocks.into_keys());
            self.bodies.requeue_dirty(batch.body_blocks.into_keys());
            self.info_dirty = true;
            return Err(err.context(format!("Failed to flush folder {}", self.meta.id)));
        }
        self.info_dirty = false;
        log::debug!("Flushed {} blocks of {}", blocks, self.meta.id);
        Ok(blocks)
    }

    /// Run `f` once every pending write is durable.
    ///
    /// If the writes fail, `f` does not run. No purge runs before `f`, so
    /// what was just written is still stored when `f` sees it.
    pub fn run_after_deferred_calls<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R> {
        self.commit()?;
        Ok(f(self))
    }

    /// Drop clean blocks from memory. Returns how many were released.
    pub fn release_memory(&mut self) -> usize {
        let released = self.headers.release_clean() + self.bodies.release_clean();
        log::debug!("Released {} blocks of {}", released, self.meta.id);
        released
    }
}

/// Whether a slice that isn't being filled by a sync takes a new header
fn accepts_passive_add(slice: &MailSlice, key: SortKey, youngest_before: Option<SortKey>) -> bool {
    match (slice.end_key(), slice.start_key()) {
        (Some(newest), Some(oldest)) => {
            if key > oldest {
                false
            } else if key < newest {
                // New mail: only a slice showing the top of the folder grows up
                youngest_before.is_none_or(|youngest| youngest == newest)
            } else {
                true
            }
        }
        _ => slice.flags().at_top,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::HOUR_MILLIS;
    use crate::models::{BodyInfo, FolderType, flags};
    use crate::slice::{BufferedConsumer, SliceEvent};
    use crate::storage::InMemoryMailDb;

    /// 2024-03-09T12:00:00Z
    const NOW: i64 = 1_709_985_600_000;

    fn inbox() -> FolderMeta {
        FolderMeta::new("inbox", "Inbox", FolderType::Inbox)
    }

    fn make_storage() -> (FolderStorage, Arc<InMemoryMailDb>) {
        let db = Arc::new(InMemoryMailDb::new());
        let storage = FolderStorage::open(inbox(), db.clone(), &SyncSettings::default()).unwrap();
        (storage, db)
    }

    fn add(storage: &mut FolderStorage, date: i64) -> HeaderInfo {
        let id = storage.allocate_header_id();
        let header = HeaderInfo::builder(id, format!("srv-{id}")).date(date).build();
        storage.add_message_header(header.clone()).unwrap();
        storage.add_message_body(BodyInfo::new(id, date, 1_000)).unwrap();
        header
    }

    /// `count` messages an hour apart, newest one hour before NOW
    fn add_recent(storage: &mut FolderStorage, count: usize) -> Vec<HeaderInfo> {
        (0..count)
            .map(|i| add(storage, NOW - (i as i64 + 1) * HOUR_MILLIS))
            .collect()
    }

    fn open_consumer() -> (BufferedConsumer, Box<dyn SliceConsumer>) {
        let consumer = BufferedConsumer::new();
        (consumer.clone(), Box::new(consumer))
    }

    #[test]
    fn test_allocated_ids_increase() {
        let (mut storage, _db) = make_storage();
        let a = storage.allocate_header_id();
        let b = storage.allocate_header_id();
        assert!(b > a);
        assert_eq!(storage.persistence_info().next_header_id, b + 1);
    }

    #[test]
    fn test_queries_follow_listing_order() {
        let (mut storage, _db) = make_storage();
        let headers = add_recent(&mut storage, 10);

        assert_eq!(storage.known_message_count(), 10);
        assert!(storage.header_is_youngest_known(headers[0].sort_key()));
        assert!(storage.header_is_oldest_known(headers[9].sort_key()));

        let before = storage.get_messages_before_message(Some(headers[2].sort_key()), 3).unwrap();
        assert_eq!(before.iter().map(|h| h.id).collect::<Vec<_>>(), vec![headers[3].id, headers[4].id, headers[5].id]);

        let after = storage.get_messages_after_message(headers[5].sort_key(), 2).unwrap();
        assert_eq!(after.iter().map(|h| h.id).collect::<Vec<_>>(), vec![headers[3].id, headers[4].id]);

        let in_range = storage
            .get_messages_in_date_range(Some(headers[4].date), Some(headers[1].date), None)
            .unwrap();
        assert_eq!(in_range.len(), 3);

        let body = storage.get_message_body(headers[0].date, headers[0].id).unwrap().unwrap();
        assert_eq!(body.size, 1_000);
    }

    #[test]
    fn test_add_notifies_slice_at_top() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 3);
        let (consumer, boxed) = open_consumer();
        let (id, request) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();
        assert!(request.is_none());
        assert_eq!(storage.slice(id).unwrap().len(), 3);

        let newest = add(&mut storage, NOW - 10);
        let slice = storage.slice(id).unwrap();
        assert_eq!(slice.headers()[0].id, newest.id);
        // Desired count stays put, so the oldest header is pushed out
        assert_eq!(slice.len(), 3);
        assert_eq!(consumer.mirror(), slice.headers());
    }

    #[test]
    fn test_slice_not_at_top_ignores_new_mail() {
        let (mut storage, _db) = make_storage();
        let headers = add_recent(&mut storage, 10);
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();
        // The UI scrolled down: keep headers 2..=9
        storage.slice_note_ranges(id, 2, headers[2].id, 9, headers[9].id);
        assert_eq!(storage.slice(id).unwrap().len(), 8);

        add(&mut storage, NOW - 10);
        assert_eq!(storage.slice(id).unwrap().len(), 8);
        assert_eq!(storage.slice(id).unwrap().headers()[0].id, headers[2].id);
        assert_eq!(consumer.mirror(), storage.slice(id).unwrap().headers());
    }

    #[test]
    fn test_update_and_delete_reach_covering_slice() {
        let (mut storage, _db) = make_storage();
        let headers = add_recent(&mut storage, 5);
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();

        let target = &headers[2];
        let changed = storage
            .update_message_header(target.date, target.id, |h| h.flags.insert(flags::SEEN.to_string()))
            .unwrap();
        assert!(changed);
        assert!(storage.slice(id).unwrap().headers()[2].is_read());

        storage.delete_message_header_and_body(target.date, target.id).unwrap();
        assert_eq!(storage.slice(id).unwrap().len(), 4);
        assert!(storage.get_message_body(target.date, target.id).unwrap().is_none());
        assert_eq!(consumer.mirror(), storage.slice(id).unwrap().headers());
    }

    #[test]
    fn test_update_unknown_header_is_noop() {
        let (mut storage, _db) = make_storage();
        assert!(!storage.update_message_header(5, 5, |_| true).unwrap());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without its header")]
    fn test_body_without_header_is_invariant_violation() {
        let (mut storage, _db) = make_storage();
        let _ = storage.add_message_body(BodyInfo::new(1, 100, 10));
    }

    #[test]
    fn test_run_after_deferred_calls_waits_for_commit() {
        let (mut storage, db) = make_storage();
        add_recent(&mut storage, 2);
        assert_eq!(db.commit_count(), 0);

        let commits_seen = storage.run_after_deferred_calls(|_| db.commit_count()).unwrap();
        assert_eq!(commits_seen, 1);
        assert!(!storage.has_unflushed_changes());
    }

    #[test]
    fn test_failed_flush_skips_callback_and_retries() {
        let (mut storage, db) = make_storage();
        add_recent(&mut storage, 2);
        db.set_fail_writes(true);

        let mut ran = false;
        assert!(storage.run_after_deferred_calls(|_| ran = true).is_err());
        assert!(!ran);
        assert!(storage.has_unflushed_changes());

        db.set_fail_writes(false);
        assert!(storage.flush(NOW).unwrap() > 0);
        assert_eq!(db.commit_count(), 1);
    }

    #[test]
    fn test_reopen_restores_everything() {
        let db = Arc::new(InMemoryMailDb::new());
        let settings = SyncSettings::default();
        let (info, headers) = {
            let mut storage = FolderStorage::open(inbox(), db.clone(), &settings).unwrap();
            let headers = add_recent(&mut storage, 40);
            storage.mark_sync_range(NOW - 3 * DAY_MILLIS, tomorrow(NOW), Some("42".into()), NOW);
            storage.flush(NOW).unwrap();
            (storage.persistence_info(), headers)
        };

        let mut reopened = FolderStorage::open(inbox(), db, &settings).unwrap();
        assert_eq!(reopened.persistence_info(), info);
        let all = reopened.get_all_messages_in_date_range(None, None).unwrap();
        assert_eq!(all, headers);
        assert_eq!(reopened.allocate_header_id(), 40);
    }

    #[test]
    fn test_release_memory_reloads_lazily() {
        let (mut storage, _db) = make_storage();
        let headers = add_recent(&mut storage, 30);
        storage.flush(NOW).unwrap();
        assert!(storage.release_memory() > 0);

        let h = storage.get_message_header(headers[17].date, headers[17].id).unwrap();
        assert_eq!(h.as_ref(), Some(&headers[17]));
    }

    #[test]
    fn test_open_from_now_without_data_syncs_initial_days() {
        let (mut storage, _db) = make_storage();
        let (consumer, boxed) = open_consumer();
        let (id, request) = storage.slice_open_from_now(boxed, None, false, true, NOW).unwrap();

        let request = request.unwrap();
        assert_eq!(request.kind, SyncKind::Deepen { accumulate: false });
        assert_eq!(request.window, DateWindow::since(make_days_ago(NOW, 3)));
        assert_eq!(storage.cur_sync_slice(), Some(id));
        assert_eq!(consumer.last_status(), Some(SliceStatus::Synchronizing));
    }

    #[test]
    fn test_open_from_now_fresh_data_shows_then_refreshes() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 20);
        storage.mark_sync_range(make_days_ago(NOW, 3), tomorrow(NOW), None, NOW - HOUR_MILLIS);

        let (consumer, boxed) = open_consumer();
        let (id, request) = storage.slice_open_from_now(boxed, None, false, true, NOW).unwrap();

        assert_eq!(request.unwrap().kind, SyncKind::Refresh);
        assert_eq!(storage.slice(id).unwrap().len(), 15);
        assert_eq!(consumer.mirror().len(), 15);
        assert_eq!(storage.cur_sync_slice(), None);
    }

    #[test]
    fn test_open_from_now_known_range_accumulates() {
        let (mut storage, _db) = make_storage();
        let headers = add_recent(&mut storage, 20);
        // Too old to show directly for an inbox, fresh enough to trust its range
        storage.mark_sync_range(make_days_ago(NOW, 3), tomorrow(NOW), None, NOW - 3 * HOUR_MILLIS);

        let (consumer, boxed) = open_consumer();
        let (id, request) = storage.slice_open_from_now(boxed, None, false, true, NOW).unwrap();

        let request = request.unwrap();
        assert_eq!(request.kind, SyncKind::Deepen { accumulate: true });
        assert_eq!(request.window.start, Some(quantize_date(headers[14].date)));
        assert!(storage.slice(id).unwrap().is_accumulating());
        assert!(consumer.mirror().is_empty());
    }

    #[test]
    fn test_open_from_now_force_deepening() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 5);
        storage.mark_sync_range(make_days_ago(NOW, 3), tomorrow(NOW), None, NOW);

        let (_consumer, boxed) = open_consumer();
        let (_, request) = storage.slice_open_from_now(boxed, Some(7), true, true, NOW).unwrap();
        assert_eq!(request.unwrap().window, DateWindow::since(make_days_ago(NOW, 7)));
    }

    #[test]
    fn test_open_most_recent_fresh_needs_no_sync() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 5);
        storage.mark_sync_range(make_days_ago(NOW, 3), tomorrow(NOW), None, NOW - 10);

        let (consumer, boxed) = open_consumer();
        let (_, request) = storage.slice_open_most_recent(boxed, false, true, NOW).unwrap();
        assert!(request.is_none());
        assert_eq!(consumer.last_status(), Some(SliceStatus::Synced));
        assert_eq!(consumer.mirror().len(), 5);

        let (_consumer, boxed) = open_consumer();
        let (_, forced) = storage.slice_open_most_recent(boxed, true, true, NOW).unwrap();
        assert_eq!(forced.unwrap().kind, SyncKind::Refresh);
    }

    #[test]
    fn test_sync_completion_marks_entire_folder() {
        let (mut storage, _db) = make_storage();
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, true, NOW).unwrap();
        add_recent(&mut storage, 4);
        storage.mark_sync_range(make_days_ago(NOW, 3), tomorrow(NOW), None, NOW);

        // The server says 4 messages and we hold all 4
        let more = storage.on_sync_completed(id, Some(4), false, false, NOW);
        assert!(!more);
        assert!(storage.synced_to_dawn_of_time());
        assert_eq!(consumer.last_status(), Some(SliceStatus::Synced));
        assert_eq!(consumer.last_flags().map(|f| f.at_bottom), Some(true));
        assert_eq!(storage.cur_sync_slice(), None);
    }

    #[test]
    fn test_sync_completion_wants_more_until_full() {
        let (mut storage, _db) = make_storage();
        let (_consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, true, NOW).unwrap();
        add_recent(&mut storage, 4);

        assert!(storage.on_sync_completed(id, None, false, false, NOW));
        // Limited syncs never ask for more
        assert!(!storage.on_sync_completed(id, None, true, false, NOW));
    }

    #[test]
    fn test_accumulated_headers_released_in_one_splice() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 20);
        storage.mark_sync_range(make_days_ago(NOW, 3), tomorrow(NOW), None, NOW - 3 * HOUR_MILLIS);
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, true, NOW).unwrap();

        // The sync re-reports the stored headers
        for header in storage.get_messages_in_date_range(None, None, None).unwrap() {
            storage.unchanged_message_header(&header);
        }
        assert!(consumer.mirror().is_empty());

        assert!(!storage.on_sync_completed(id, None, false, false, NOW));
        let splices = consumer
            .events()
            .iter()
            .filter(|e| matches!(e, SliceEvent::Splice { .. }))
            .count();
        assert_eq!(splices, 1);
        assert_eq!(consumer.mirror().len(), 15);
        assert_eq!(consumer.mirror(), storage.slice(id).unwrap().headers());
    }

    #[test]
    fn test_failed_sync_discards_accumulated() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 20);
        storage.mark_sync_range(make_days_ago(NOW, 3), tomorrow(NOW), None, NOW - 3 * HOUR_MILLIS);
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, true, NOW).unwrap();
        let header = storage.get_messages_in_date_range(None, None, Some(1)).unwrap().remove(0);
        storage.unchanged_message_header(&header);

        storage.slice_sync_failed(id);
        assert!(storage.slice(id).unwrap().is_empty());
        assert_eq!(consumer.last_status(), Some(SliceStatus::SyncFailed));
        assert_eq!(storage.cur_sync_slice(), None);
    }

    #[test]
    fn test_grow_older_from_fresh_storage() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 30);
        storage.mark_sync_range(make_days_ago(NOW, 5), tomorrow(NOW), None, NOW);
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_most_recent(boxed, false, true, NOW).unwrap();
        assert_eq!(storage.slice(id).unwrap().len(), 15);

        let request = storage.grow_slice(id, GrowDirection::Older, 10, false, true, NOW).unwrap();
        assert!(request.is_none());
        assert_eq!(storage.slice(id).unwrap().len(), 25);
        assert_eq!(consumer.mirror(), storage.slice(id).unwrap().headers());
    }

    #[test]
    fn test_grow_older_over_stale_span_requests_limited_sync() {
        let (mut storage, _db) = make_storage();
        // One message a day for 30 days
        for i in 0..30 {
            add(&mut storage, NOW - (i + 1) * DAY_MILLIS);
        }
        storage.mark_sync_range(make_days_ago(NOW, 40), tomorrow(NOW), None, NOW - 30 * DAY_MILLIS);
        let (_consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();
        let start = storage.slice(id).unwrap().start_key().unwrap();

        let request = storage
            .grow_slice(id, GrowDirection::Older, 5, false, true, NOW)
            .unwrap()
            .unwrap();
        assert_eq!(request.kind, SyncKind::Limited);
        assert_eq!(request.window.end, Some(quantize_date(start.date)));
        assert_eq!(storage.cur_sync_slice(), Some(id));
    }

    #[test]
    fn test_grow_newer_from_storage() {
        let (mut storage, _db) = make_storage();
        let headers = add_recent(&mut storage, 10);
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();
        storage.slice_note_ranges(id, 5, headers[5].id, 9, headers[9].id);

        storage.grow_slice(id, GrowDirection::Newer, 3, true, true, NOW).unwrap();
        let slice = storage.slice(id).unwrap();
        assert_eq!(slice.headers()[0].id, headers[2].id);
        assert_eq!(slice.len(), 8);
        assert_eq!(consumer.mirror(), slice.headers());
    }

    #[test]
    fn test_refresh_window_tracks_known_bounds() {
        let (mut storage, _db) = make_storage();
        let headers = add_recent(&mut storage, 10);
        storage.mark_sync_range(make_days_ago(NOW, 2), tomorrow(NOW), None, NOW);
        let (_consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();

        let request = storage.refresh_slice(id, NOW).unwrap().unwrap();
        // Holds the newest: open ended. Holds the oldest: back to full coverage.
        assert_eq!(request.window.end, None);
        assert_eq!(request.window.start, Some(make_days_ago(NOW, 2)));

        storage.slice_note_ranges(id, 2, headers[2].id, 5, headers[5].id);
        let request = storage.refresh_slice(id, NOW).unwrap().unwrap();
        assert_eq!(request.window.start, Some(quantize_date(headers[5].date)));
        assert_eq!(request.window.end, Some(quantize_date(headers[2].date + DAY_MILLIS)));
    }

    #[test]
    fn test_refresh_explosion_resets_slice() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 5);
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();

        let request = storage.refresh_exploded(id, NOW).unwrap();
        assert_eq!(request.kind, SyncKind::Deepen { accumulate: false });
        assert!(storage.slice(id).unwrap().is_empty());
        assert!(consumer.mirror().is_empty());
        assert_eq!(storage.cur_sync_slice(), Some(id));
    }

    #[test]
    fn test_killed_slice_gets_nothing() {
        let (mut storage, _db) = make_storage();
        add_recent(&mut storage, 2);
        let (consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();
        storage.kill_slice(id);
        let before = consumer.events().len();

        add(&mut storage, NOW - 5);
        assert_eq!(consumer.events().len(), before);
        assert!(storage.slice(id).is_none());
        assert!(!storage.on_sync_completed(id, None, false, false, NOW));
    }

    #[test]
    fn test_local_flag_edit_and_reconcile() {
        let (mut storage, _db) = make_storage();
        let headers = add_recent(&mut storage, 1);
        let h = &headers[0];

        assert!(storage.set_local_flag(h.date, h.id, flags::SEEN, true).unwrap());
        assert!(storage.pending_flag_edits(h.id).unwrap().touches(flags::SEEN));

        // Server doesn't know about the read yet but has a star from elsewhere
        let remote: BTreeSet<String> = [flags::FLAGGED.to_string()].into();
        let merged = storage.reconcile_flags(h.id, &remote);
        assert!(merged.contains(flags::SEEN));
        assert!(merged.contains(flags::FLAGGED));
        assert!(storage.pending_flag_edits(h.id).is_some());

        // Server caught up
        let remote: BTreeSet<String> = [flags::SEEN.to_string()].into();
        storage.reconcile_flags(h.id, &remote);
        assert!(storage.pending_flag_edits(h.id).is_none());

        assert!(storage.set_local_flag(1, 999, flags::SEEN, true).is_err());
    }

    fn purge_settings() -> SyncSettings {
        let mut settings = SyncSettings::default();
        settings.storage.purge_every_body_blocks = 1;
        settings.storage.max_blocks_per_family = 2;
        settings
    }

    /// One body per block: each body is bigger than half a block
    fn add_big(storage: &mut FolderStorage, date: i64) -> HeaderInfo {
        let id = storage.allocate_header_id();
        let header = HeaderInfo::builder(id, format!("srv-{id}")).date(date).build();
        storage.add_message_header(header.clone()).unwrap();
        storage.add_message_body(BodyInfo::new(id, date, 5_000)).unwrap();
        header
    }

    #[test]
    fn test_purge_over_block_limit() {
        let db = Arc::new(InMemoryMailDb::new());
        let mut storage = FolderStorage::open(inbox(), db, &purge_settings()).unwrap();
        for i in 0..6 {
            add_big(&mut storage, NOW - (i + 1) * DAY_MILLIS);
        }
        storage.mark_sync_range(make_days_ago(NOW, 10), tomorrow(NOW), None, NOW);
        assert_eq!(storage.body_block_count(), 6);

        let purged = storage.purge(NOW).unwrap();
        assert_eq!(purged, 4);
        assert_eq!(storage.body_block_count(), 2);
        assert_eq!(storage.known_message_count(), 2);
        // The purged spans are known but no longer fully synced
        assert_eq!(storage.oldest_full_sync_date(), Some(NOW - 3 * DAY_MILLIS + 1));
    }

    #[test]
    fn test_purge_stale_blocks_only_when_not_shown() {
        let db = Arc::new(InMemoryMailDb::new());
        let mut settings = purge_settings();
        settings.storage.max_blocks_per_family = 100;
        let mut storage = FolderStorage::open(inbox(), db, &settings).unwrap();
        for i in 0..4 {
            add_big(&mut storage, NOW - (i + 1) * DAY_MILLIS);
        }
        storage.mark_sync_range(make_days_ago(NOW, 10), tomorrow(NOW), None, NOW - 30 * DAY_MILLIS);

        let (_consumer, boxed) = open_consumer();
        let (id, _) = storage.slice_open_from_now(boxed, None, false, false, NOW).unwrap();
        assert_eq!(storage.purge(NOW).unwrap(), 0);

        storage.kill_slice(id);
        assert_eq!(storage.purge(NOW).unwrap(), 3);
        assert_eq!(storage.known_message_count(), 1);
    }

    #[test]
    fn test_flush_runs_due_purge() {
        let db = Arc::new(InMemoryMailDb::new());
        let mut storage = FolderStorage::open(inbox(), db.clone(), &purge_settings()).unwrap();
        for i in 0..4 {
            add_big(&mut storage, NOW - (i + 1) * DAY_MILLIS);
        }
        storage.flush(NOW).unwrap();
        assert_eq!(storage.body_block_count(), 2);
        assert_eq!(db.block_count("inbox", crate::models::BlockKind::Body), 2);
    }

    #[test]
    fn test_flush_judges_staleness_by_given_time() {
        let db = Arc::new(InMemoryMailDb::new());
        let mut settings = purge_settings();
        settings.storage.max_blocks_per_family = 100;
        let mut storage = FolderStorage::open(inbox(), db, &settings).unwrap();
        for i in 0..4 {
            add_big(&mut storage, NOW - (i + 1) * DAY_MILLIS);
        }
        // Fresh at NOW, though long stale by the wall clock
        storage.mark_sync_range(make_days_ago(NOW, 10), tomorrow(NOW), None, NOW);
        storage.flush(NOW).unwrap();
        assert_eq!(storage.body_block_count(), 4);

        for i in 4..6 {
            add_big(&mut storage, NOW - (i + 1) * DAY_MILLIS);
        }
        storage.flush(NOW + 30 * DAY_MILLIS).unwrap();
        assert_eq!(storage.body_block_count(), 1);
    }

    #[test]
    fn test_header_blocks_over_limit_are_purged() {
        let db = Arc::new(InMemoryMailDb::new());
        let mut storage = FolderStorage::open(inbox(), db, &purge_settings()).unwrap();
        let headers: Vec<HeaderInfo> = (0..100)
            .map(|i| {
                let date = NOW - (i + 1) * HOUR_MILLIS;
                let id = storage.allocate_header_id();
                let header = HeaderInfo::builder(id, format!("srv-{id}")).date(date).build();
                storage.add_message_header(header.clone()).unwrap();
                storage.add_message_body(BodyInfo::new(id, date, 10)).unwrap();
                header
            })
            .collect();
        storage.mark_sync_range(make_days_ago(NOW, 10), tomorrow(NOW), None, NOW);
        assert!(storage.header_block_count() > 2);
        assert_eq!(storage.body_block_count(), 1);

        assert!(storage.purge(NOW).unwrap() > 0);
        assert_eq!(storage.header_block_count(), 2);
        let kept = storage.known_message_count();
        assert!(kept < 100);

        // The newest messages survive with their bodies, the oldest lost both
        let newest = &headers[0];
        assert!(storage.get_message_body(newest.date, newest.id).unwrap().is_some());
        let oldest = &headers[99];
        assert!(storage.get_message_header(oldest.date, oldest.id).unwrap().is_none());
        assert!(storage.get_message_body(oldest.date, oldest.id).unwrap().is_none());
        let remaining = storage.get_all_messages_in_date_range(None, None).unwrap();
        for header in &remaining {
            assert!(storage.get_message_body(header.date, header.id).unwrap().is_some());
        }
        assert_eq!(remaining.len(), kept);
        // The dropped span no longer counts as fully synced
        assert!(storage.oldest_full_sync_date().unwrap() > oldest.date);
    }
}
