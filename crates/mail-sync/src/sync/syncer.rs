//! Driving a slice's sync request to completion
//!
//! A refresh is a single pass that gives up on the first bisection. A limited
//! sync is a single pass over its window. A deepening sync keeps stepping
//! into the past, one window per pass, until the slice has the headers it
//! wants or nothing older is left on the server.

use super::connection::FolderConnection;
use super::coordinator::{BisectDecision, BisectInfo, PassOutcome, SyncCoordinator, SyncError, SyncReport};
use super::timing;
use crate::config::SyncConfig;
use crate::date::{DateWindow, OLDEST_SYNC_DATE, make_days_before, quantize_date};
use crate::storage::{FolderStorage, SyncKind, SyncRequest};

pub struct FolderSyncer {
    config: SyncConfig,
    bisect_limit: usize,
}

/// Progress of a deepening sync between passes
#[derive(Debug, Clone, Copy)]
struct Deepening {
    /// Oldest point synced so far
    cur_start: i64,
    day_step: i64,
    /// Bisection found dense mail down to here; don't grow steps before
    /// the sync is past it
    do_not_grow_before: Option<i64>,
}

impl FolderSyncer {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            config: config.clone(),
            bisect_limit: config.bisect_limit,
        }
    }

    pub fn with_bisect_limit(mut self, bisect_limit: usize) -> Self {
        self.bisect_limit = bisect_limit;
        self
    }

    fn coordinator(&self, now: i64) -> SyncCoordinator {
        SyncCoordinator::new(&self.config, now).with_bisect_limit(self.bisect_limit)
    }

    /// Run `request` for its slice.
    ///
    /// Returns a follow-up request when the sync turned into a different one,
    /// e.g. a refresh that found too much new mail.
    pub fn run(
        &self,
        storage: &mut FolderStorage,
        conn: &mut dyn FolderConnection,
        request: &SyncRequest,
        now: i64,
    ) -> Result<Option<SyncRequest>, SyncError> {
        log::debug!("Running {:?} sync of {} for {}", request.kind, request.window, request.slice_id);
        match request.kind {
            SyncKind::Refresh => self.refresh(storage, conn, request, now),
            SyncKind::Limited => {
                let mut coordinator = self.coordinator(now);
                coordinator.sync_date_range(storage, conn, request.window, &mut |_: &BisectInfo| {
                    BisectDecision::Continue
                })?;
                storage.on_sync_completed(request.slice_id, conn.total_messages(), true, false, now);
                Ok(None)
            }
            SyncKind::Deepen { .. } => {
                self.deepen(storage, conn, request, now)?;
                Ok(None)
            }
        }
    }

    fn refresh(
        &self,
        storage: &mut FolderStorage,
        conn: &mut dyn FolderConnection,
        request: &SyncRequest,
        now: i64,
    ) -> Result<Option<SyncRequest>, SyncError> {
        let mut coordinator = self.coordinator(now);
        let outcome = coordinator.sync_date_range(storage, conn, request.window, &mut |_: &BisectInfo| {
            BisectDecision::Abort
        })?;
        match outcome {
            PassOutcome::Synced(_) => {
                storage.finish_refresh(request.slice_id);
                Ok(None)
            }
            PassOutcome::Aborted(info) => {
                log::info!(
                    "Refresh of {} found {} messages in {}; starting over from now",
                    request.slice_id,
                    info.num_headers,
                    info.old_window
                );
                Ok(storage.refresh_exploded(request.slice_id, now))
            }
        }
    }

    fn deepen(
        &self,
        storage: &mut FolderStorage,
        conn: &mut dyn FolderConnection,
        request: &SyncRequest,
        now: i64,
    ) -> Result<(), SyncError> {
        let mut coordinator = self.coordinator(now);
        let mut window = request.window;
        let mut state = Deepening {
            cur_start: window.effective_start(),
            day_step: self.config.initial_sync_days.max(1),
            do_not_grow_before: None,
        };

        loop {
            let mut last_bisect: Option<BisectInfo> = None;
            let outcome = coordinator.sync_date_range(storage, conn, window, &mut |info: &BisectInfo| {
                last_bisect = Some(*info);
                BisectDecision::Continue
            })?;
            let report = match outcome {
                PassOutcome::Synced(report) => report,
                // Deepening never aborts a bisection
                PassOutcome::Aborted(_) => return Ok(()),
            };

            if let Some(info) = last_bisect {
                state.do_not_grow_before = Some(info.old_window.effective_start());
                state.day_step = info.day_step;
            }
            state.cur_start = report.window.effective_start();

            let exhausted = state.cur_start <= OLDEST_SYNC_DATE;
            let wants_more = storage.on_sync_completed(
                request.slice_id,
                conn.total_messages(),
                false,
                exhausted,
                now,
            );
            if !wants_more || exhausted {
                return Ok(());
            }

            window = self.next_window(&mut state, &report, now);
            log::debug!(
                "Deepening {} into {} (step {} days)",
                request.slice_id,
                window,
                state.day_step
            );
        }
    }

    /// The window just before `state.cur_start`, growing the step after an
    /// empty pass unless a bisection said mail is dense here
    fn next_window(&self, state: &mut Deepening, report: &SyncReport, now: i64) -> DateWindow {
        let still_dense = state
            .do_not_grow_before
            .is_some_and(|boundary| state.cur_start > boundary);
        if !report.saw_messages() && !still_dense {
            let days_back = timing::days_in_past(state.cur_start, quantize_date(now));
            state.day_step = timing::grown_day_step(state.day_step, days_back, &self.config);
        }
        let start = make_days_before(state.cur_start, state.day_step).max(OLDEST_SYNC_DATE);
        DateWindow::between(start, state.cur_start)
    }
}
