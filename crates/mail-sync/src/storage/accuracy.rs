//! Tracking which time spans of a folder are known to match the server
//!
//! Ranges are half-open `[start_ts, end_ts)`, never overlap, and are kept
//! sorted newest first. Marking a span synced replaces whatever coverage the
//! span had before, trimming or splitting neighbours; adjacent ranges from
//! the same sync are merged back together.

use crate::date::{OLDEST_SYNC_DATE, now_ms};
use crate::models::AccuracyRange;

/// A span that needs to be fetched again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshGap {
    pub start_ts: i64,
    pub end_ts: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccuracyTracker {
    ranges: Vec<AccuracyRange>,
}

impl AccuracyTracker {
    pub fn new(mut ranges: Vec<AccuracyRange>) -> Self {
        ranges.sort_by(|a, b| b.end_ts.cmp(&a.end_ts));
        Self { ranges }
    }

    /// Ranges, newest first
    pub fn ranges(&self) -> &[AccuracyRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Most recently ending range
    pub fn newest(&self) -> Option<&AccuracyRange> {
        self.ranges.first()
    }

    /// Record that `[start_ts, end_ts)` was synchronized at `synced_at`.
    ///
    /// Marking the same span twice leaves a single range.
    pub fn mark_synced(
        &mut self,
        start_ts: i64,
        end_ts: i64,
        full_sync: bool,
        synced_at: i64,
        sync_token: Option<String>,
    ) {
        if start_ts >= end_ts {
            log::warn!("Ignoring empty accuracy range [{}, {})", start_ts, end_ts);
            return;
        }
        self.cut(start_ts, end_ts);
        self.ranges.push(AccuracyRange {
            start_ts,
            end_ts,
            full_sync,
            synced_at,
            sync_token,
        });
        self.ranges.sort_by(|a, b| b.end_ts.cmp(&a.end_ts));
        self.merge_adjacent();
    }

    /// Forget everything known about `[start_ts, end_ts)`.
    ///
    /// Used when the server says our sync state is no longer valid.
    pub fn discard(&mut self, start_ts: i64, end_ts: i64) {
        if start_ts < end_ts {
            self.cut(start_ts, end_ts);
        }
    }

    /// Mark every range overlapping `[start_ts, end_ts)` as no longer fully
    /// synced within that span, keeping its coverage and timestamp.
    pub fn downgrade(&mut self, start_ts: i64, end_ts: i64) {
        let mut pieces = Vec::new();
        for range in self.ranges.drain(..) {
            if !range.overlaps(start_ts, end_ts) || !range.full_sync {
                pieces.push(range);
                continue;
            }
            let lo = range.start_ts.max(start_ts);
            let hi = range.end_ts.min(end_ts);
            if range.end_ts > hi {
                pieces.push(AccuracyRange {
                    start_ts: hi,
                    ..range.clone()
                });
            }
            pieces.push(AccuracyRange {
                start_ts: lo,
                end_ts: hi,
                full_sync: false,
                ..range.clone()
            });
            if range.start_ts < lo {
                pieces.push(AccuracyRange {
                    end_ts: lo,
                    ..range
                });
            }
        }
        self.ranges = pieces;
        self.ranges.sort_by(|a, b| b.end_ts.cmp(&a.end_ts));
        self.merge_adjacent();
    }

    /// Remove coverage of `[start_ts, end_ts)`, trimming or splitting
    /// ranges that stick out on either side.
    fn cut(&mut self, start_ts: i64, end_ts: i64) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if !range.overlaps(start_ts, end_ts) {
                kept.push(range);
                continue;
            }
            if range.end_ts > end_ts {
                kept.push(AccuracyRange {
                    start_ts: end_ts,
                    ..range.clone()
                });
            }
            if range.start_ts < start_ts {
                kept.push(AccuracyRange {
                    end_ts: start_ts,
                    ..range
                });
            }
        }
        self.ranges = kept;
    }

    fn merge_adjacent(&mut self) {
        let mut merged: Vec<AccuracyRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(newer) if newer.start_ts == range.end_ts && newer.same_sync_as(&range) => {
                    newer.start_ts = range.start_ts;
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    /// The part of `[start_ts, end_ts)` that is uncovered, only partially
    /// synced, or synced longer than `stale_ms` ago. None if all of it is
    /// fresh.
    pub fn needs_refresh(&self, start_ts: i64, end_ts: i64, stale_ms: i64) -> Option<RefreshGap> {
        self.needs_refresh_at(start_ts, end_ts, stale_ms, now_ms())
    }

    pub fn needs_refresh_at(
        &self,
        start_ts: i64,
        end_ts: i64,
        stale_ms: i64,
        now: i64,
    ) -> Option<RefreshGap> {
        let mut gap: Option<RefreshGap> = None;
        let mut add = |lo: i64, hi: i64| {
            if lo >= hi {
                return;
            }
            gap = Some(match gap {
                Some(g) => RefreshGap {
                    start_ts: g.start_ts.min(lo),
                    end_ts: g.end_ts.max(hi),
                },
                None => RefreshGap {
                    start_ts: lo,
                    end_ts: hi,
                },
            });
        };

        // Walk newest to oldest; `cursor` is the oldest point checked so far
        let mut cursor = end_ts;
        for range in self.ranges.iter().filter(|r| r.overlaps(start_ts, end_ts)) {
            let hi = range.end_ts.min(end_ts);
            let lo = range.start_ts.max(start_ts);
            add(hi, cursor);
            if !range.full_sync || now - range.synced_at > stale_ms {
                add(lo, hi);
            }
            cursor = lo;
        }
        add(start_ts, cursor);
        gap
    }

    /// Record that the server has nothing older than what we have seen.
    ///
    /// The newest range is stretched back to `OLDEST_SYNC_DATE` and
    /// everything it now covers is folded into it.
    pub fn mark_synced_to_dawn_of_time(&mut self, now: i64) {
        match self.ranges.first().cloned() {
            Some(mut newest) => {
                newest.start_ts = newest.start_ts.min(OLDEST_SYNC_DATE);
                newest.full_sync = true;
                self.ranges = vec![newest];
            }
            None => self.ranges.push(AccuracyRange {
                start_ts: OLDEST_SYNC_DATE,
                end_ts: now,
                full_sync: true,
                synced_at: now,
                sync_token: None,
            }),
        }
    }

    /// Start of the contiguous run of full-sync ranges that begins with the
    /// newest range. None if the newest range isn't a full sync.
    pub fn oldest_full_sync_date(&self) -> Option<i64> {
        let mut oldest = None;
        let mut expected_end: Option<i64> = None;
        for range in &self.ranges {
            if !range.full_sync || expected_end.is_some_and(|end| end != range.end_ts) {
                break;
            }
            oldest = Some(range.start_ts);
            expected_end = Some(range.start_ts);
        }
        oldest
    }

    pub fn synced_to_dawn_of_time(&self) -> bool {
        self.oldest_full_sync_date()
            .is_some_and(|oldest| oldest <= OLDEST_SYNC_DATE)
    }

    /// Latest `synced_at` of any full-sync range overlapping the span
    pub fn last_synced_within(&self, start_ts: i64, end_ts: i64) -> Option<i64> {
        self.ranges
            .iter()
            .filter(|r| r.full_sync && r.overlaps(start_ts, end_ts))
            .map(|r| r.synced_at)
            .max()
    }

    pub fn into_ranges(self) -> Vec<AccuracyRange> {
        self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(tracker: &AccuracyTracker) -> Vec<(i64, i64, bool)> {
        tracker
            .ranges()
            .iter()
            .map(|r| (r.start_ts, r.end_ts, r.full_sync))
            .collect()
    }

    #[test]
    fn test_mark_synced_is_idempotent() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(100, 200, true, 1_000, None);
        let once = tracker.clone();
        tracker.mark_synced(100, 200, true, 1_000, None);
        assert_eq!(tracker, once);
        assert_eq!(tracker.ranges().len(), 1);
    }

    #[test]
    fn test_overlapping_marks_split_neighbours() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(100, 400, true, 1_000, None);
        tracker.mark_synced(200, 300, true, 2_000, None);

        assert_eq!(
            spans(&tracker),
            vec![(300, 400, true), (200, 300, true), (100, 200, true)]
        );
        assert_eq!(tracker.ranges()[1].synced_at, 2_000);
    }

    #[test]
    fn test_overlap_trims_both_sides() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(300, 500, true, 1_000, None);
        tracker.mark_synced(100, 250, true, 1_000, None);
        tracker.mark_synced(200, 400, true, 3_000, Some("9".to_string()));

        assert_eq!(
            spans(&tracker),
            vec![(400, 500, true), (200, 400, true), (100, 200, true)]
        );
        assert_eq!(tracker.ranges()[1].sync_token.as_deref(), Some("9"));
    }

    #[test]
    fn test_adjacent_same_sync_merges() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(200, 300, true, 1_000, None);
        tracker.mark_synced(100, 200, true, 1_000, None);
        assert_eq!(spans(&tracker), vec![(100, 300, true)]);

        tracker.mark_synced(50, 100, true, 1_001, None);
        assert_eq!(tracker.ranges().len(), 2);
    }

    #[test]
    fn test_needs_refresh_stale_threshold() {
        let now = 10_000_000;
        let t0 = now - 86_400_000;
        let t1 = now;
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(t0, t1, true, now - 1_000, None);

        assert_eq!(tracker.needs_refresh_at(t0, t1, 600_000, now), None);
        assert_eq!(
            tracker.needs_refresh_at(t0, t1, 500, now),
            Some(RefreshGap {
                start_ts: t0,
                end_ts: t1
            })
        );
    }

    #[test]
    fn test_needs_refresh_reports_uncovered_span() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(500, 1_000, true, 100, None);

        let gap = tracker.needs_refresh_at(0, 1_000, 1_000, 200).unwrap();
        assert_eq!(gap, RefreshGap { start_ts: 0, end_ts: 500 });

        let gap = tracker.needs_refresh_at(500, 1_500, 1_000, 200).unwrap();
        assert_eq!(gap, RefreshGap { start_ts: 1_000, end_ts: 1_500 });

        assert!(AccuracyTracker::default().needs_refresh_at(0, 10, 1, 0).is_some());
    }

    #[test]
    fn test_needs_refresh_partial_sync_counts_as_gap() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(0, 1_000, false, 100, None);
        assert!(tracker.needs_refresh_at(0, 1_000, 1_000_000, 200).is_some());
    }

    #[test]
    fn test_discard_removes_coverage() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(0, 1_000, true, 100, None);
        tracker.discard(200, 400);
        assert_eq!(spans(&tracker), vec![(400, 1_000, true), (0, 200, true)]);
    }

    #[test]
    fn test_downgrade_keeps_coverage() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(0, 1_000, true, 100, None);
        tracker.downgrade(0, 300);
        assert_eq!(spans(&tracker), vec![(300, 1_000, true), (0, 300, false)]);
        assert_eq!(tracker.oldest_full_sync_date(), Some(300));
    }

    #[test]
    fn test_oldest_full_sync_requires_contiguity() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(500, 1_000, true, 100, None);
        tracker.mark_synced(100, 400, true, 100, None);
        assert_eq!(tracker.oldest_full_sync_date(), Some(500));

        tracker.mark_synced(400, 500, true, 200, None);
        assert_eq!(tracker.oldest_full_sync_date(), Some(100));
    }

    #[test]
    fn test_dawn_of_time() {
        let mut tracker = AccuracyTracker::default();
        assert!(!tracker.synced_to_dawn_of_time());

        tracker.mark_synced(OLDEST_SYNC_DATE + 5_000, OLDEST_SYNC_DATE + 9_000, true, 1, None);
        tracker.mark_synced(OLDEST_SYNC_DATE + 1_000, OLDEST_SYNC_DATE + 2_000, true, 1, None);
        tracker.mark_synced_to_dawn_of_time(OLDEST_SYNC_DATE + 10_000);

        assert!(tracker.synced_to_dawn_of_time());
        assert_eq!(tracker.ranges().len(), 1);
        assert_eq!(tracker.ranges()[0].end_ts, OLDEST_SYNC_DATE + 9_000);
    }

    #[test]
    fn test_dawn_of_time_on_empty_tracker() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced_to_dawn_of_time(OLDEST_SYNC_DATE + 10);
        assert!(tracker.synced_to_dawn_of_time());
    }

    #[test]
    fn test_ignores_empty_range() {
        let mut tracker = AccuracyTracker::default();
        tracker.mark_synced(10, 10, true, 1, None);
        assert!(tracker.is_empty());
    }
}
