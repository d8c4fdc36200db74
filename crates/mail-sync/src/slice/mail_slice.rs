//! A live, windowed view onto a folder's headers
//!
//! The slice holds the headers a consumer is showing, in listing order, and
//! turns storage changes into splice/update events. Its bounds are always
//! the first (newest) and last (oldest) headers it holds.

use std::fmt;

use super::consumer::{SliceConsumer, SliceEvent, SliceFlags, SliceStatus};
use crate::models::{HeaderInfo, Keyed, SortKey};

/// Handle for a slice bound to a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceId(pub u64);

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slice#{}", self.0)
    }
}

/// Direction to grow a slice in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowDirection {
    /// Toward more recent messages
    Newer,
    /// Toward older messages
    Older,
}

pub struct MailSlice {
    id: SliceId,
    consumer: Option<Box<dyn SliceConsumer>>,
    headers: Vec<HeaderInfo>,
    desired_headers: usize,
    /// Collecting headers silently; the consumer gets them in one splice
    accumulating: bool,
    /// A request for this slice is in flight
    waiting_on_data: bool,
    flags: SliceFlags,
    status: Option<SliceStatus>,
}

impl MailSlice {
    pub fn new(id: SliceId, consumer: Box<dyn SliceConsumer>, desired_headers: usize) -> Self {
        Self {
            id,
            consumer: Some(consumer),
            headers: Vec::new(),
            desired_headers,
            accumulating: false,
            waiting_on_data: false,
            flags: SliceFlags::default(),
            status: None,
        }
    }

    pub fn id(&self) -> SliceId {
        self.id
    }

    pub fn headers(&self) -> &[HeaderInfo] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn desired_headers(&self) -> usize {
        self.desired_headers
    }

    pub fn set_desired_headers(&mut self, desired: usize) {
        self.desired_headers = desired;
    }

    pub fn is_accumulating(&self) -> bool {
        self.accumulating
    }

    pub fn set_accumulating(&mut self, accumulating: bool) {
        self.accumulating = accumulating;
    }

    pub fn set_waiting_on_data(&mut self, waiting: bool) {
        self.waiting_on_data = waiting;
    }

    pub fn flags(&self) -> SliceFlags {
        self.flags
    }

    pub fn status(&self) -> Option<SliceStatus> {
        self.status
    }

    pub fn is_dead(&self) -> bool {
        self.consumer.is_none()
    }

    /// Newest header held
    pub fn end_key(&self) -> Option<SortKey> {
        self.headers.first().map(Keyed::sort_key)
    }

    /// Oldest header held
    pub fn start_key(&self) -> Option<SortKey> {
        self.headers.last().map(Keyed::sort_key)
    }

    /// True when `key` lies within the slice's bounds, inclusive
    pub fn covers(&self, key: SortKey) -> bool {
        match (self.end_key(), self.start_key()) {
            (Some(end), Some(start)) => end <= key && key <= start,
            _ => false,
        }
    }

    fn search(&self, key: SortKey) -> Result<usize, usize> {
        self.headers.binary_search_by(|h| h.sort_key().cmp(&key))
    }

    fn emit(&mut self, event: SliceEvent) {
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.deliver(event);
        }
    }

    fn splice(&mut self, index: usize, remove_count: usize, added: Vec<HeaderInfo>, more: bool) {
        let waiting = self.waiting_on_data;
        self.emit(SliceEvent::Splice {
            index,
            remove_count,
            added,
            requested: waiting,
            more_expected: waiting || more,
        });
    }

    /// A header was stored that falls in (or next to) this slice.
    ///
    /// Once the slice holds `desired_headers`, a header that would land past
    /// the tail is dropped: only an explicit grow makes a slice longer. A
    /// header landing inside pushes the oldest one out instead.
    pub fn on_header_added(&mut self, header: &HeaderInfo, sync_driven: bool) {
        if self.is_dead() {
            return;
        }
        let idx = match self.search(header.sort_key()) {
            Ok(idx) => {
                // Already known, e.g. a resync re-reporting it
                self.on_existing_header(idx, header);
                return;
            }
            Err(idx) => idx,
        };

        let len = self.headers.len();
        if len >= self.desired_headers && idx == len && !self.accumulating {
            log::trace!("{}: dropping header {} past the tail", self.id, header.id);
            return;
        }

        log::trace!(
            "{}: header {} added at {} ({})",
            self.id,
            header.id,
            idx,
            if sync_driven { "sync" } else { "passive" }
        );
        self.headers.insert(idx, header.clone());
        if self.accumulating {
            return;
        }
        self.splice(idx, 0, vec![header.clone()], false);

        if self.headers.len() > self.desired_headers {
            let tail = self.headers.len() - 1;
            self.headers.truncate(tail);
            self.splice(tail, 1, Vec::new(), false);
        }
    }

    fn on_existing_header(&mut self, idx: usize, header: &HeaderInfo) {
        if self.headers[idx] == *header {
            return;
        }
        self.headers[idx] = header.clone();
        if !self.accumulating {
            self.emit(SliceEvent::Update {
                index: idx,
                header: header.clone(),
            });
        }
    }

    /// A header this slice may hold changed (flags, snippet)
    pub fn on_header_modified(&mut self, header: &HeaderInfo) {
        if self.is_dead() {
            return;
        }
        if let Ok(idx) = self.search(header.sort_key()) {
            self.on_existing_header(idx, header);
        }
    }

    /// A header this slice may hold was deleted
    pub fn on_header_removed(&mut self, header: &HeaderInfo) {
        if self.is_dead() {
            return;
        }
        if let Ok(idx) = self.search(header.sort_key()) {
            self.headers.remove(idx);
            if !self.accumulating {
                self.splice(idx, 1, Vec::new(), false);
            }
        }
    }

    /// Add a run of headers that is contiguous with the slice's content.
    ///
    /// `insert_at` None appends at the tail.
    pub fn batch_append(&mut self, headers: Vec<HeaderInfo>, insert_at: Option<usize>, more_coming: bool) {
        if self.is_dead() || headers.is_empty() {
            return;
        }
        let idx = insert_at.unwrap_or(self.headers.len()).min(self.headers.len());
        let fresh: Vec<HeaderInfo> = headers
            .into_iter()
            .filter(|h| self.search(h.sort_key()).is_err())
            .collect();
        if fresh.is_empty() {
            return;
        }
        self.headers.splice(idx..idx, fresh.iter().cloned());
        if !self.accumulating {
            self.emit(SliceEvent::Splice {
                index: idx,
                remove_count: 0,
                added: fresh,
                requested: true,
                more_expected: more_coming,
            });
        }
    }

    /// The consumer reports the range it still shows; drop everything else.
    ///
    /// Indices may be stale, so the ids are authoritative: if the header at
    /// an index doesn't match, it is looked up by id.
    pub fn note_ranges(&mut self, first_index: usize, first_id: u64, last_index: usize, last_id: u64) {
        if self.is_dead() {
            return;
        }
        let mut first = first_index;
        if self.headers.get(first).is_none_or(|h| h.id != first_id) {
            first = self.headers.iter().position(|h| h.id == first_id).unwrap_or(0);
        }
        let mut last = last_index;
        if self.headers.get(last).is_none_or(|h| h.id != last_id) {
            match self.headers.iter().rposition(|h| h.id == last_id) {
                Some(pos) => last = pos,
                None if last >= self.headers.len() => {
                    last = self.headers.len().saturating_sub(1);
                }
                None => {}
            }
        }
        if self.headers.is_empty() {
            return;
        }

        // High end first so the low-end indices stay valid
        if last + 1 < self.headers.len() {
            self.flags.at_bottom = false;
            self.flags.user_can_grow_downwards = false;
            let del = self.headers.len() - last - 1;
            self.desired_headers = self.desired_headers.saturating_sub(del);
            self.headers.truncate(last + 1);
            if !self.accumulating {
                self.emit(SliceEvent::Splice {
                    index: last + 1,
                    remove_count: del,
                    added: Vec::new(),
                    requested: true,
                    more_expected: first > 0,
                });
            }
        }
        if first > 0 && first < self.headers.len() {
            self.flags.at_top = false;
            self.desired_headers = self.desired_headers.saturating_sub(first);
            self.headers.drain(..first);
            if !self.accumulating {
                self.emit(SliceEvent::Splice {
                    index: 0,
                    remove_count: first,
                    added: Vec::new(),
                    requested: true,
                    more_expected: false,
                });
            }
        }
    }

    /// Report progress to the consumer.
    ///
    /// With `flush_accumulated`, an accumulating slice is trimmed to
    /// `desired_headers` and everything it collected goes out as one splice.
    pub fn set_status(
        &mut self,
        status: SliceStatus,
        requested: bool,
        more_expected: bool,
        flush_accumulated: bool,
    ) {
        if self.is_dead() {
            return;
        }
        self.status = Some(status);
        if status != SliceStatus::Synchronizing {
            self.waiting_on_data = false;
        }
        if flush_accumulated && self.accumulating {
            self.headers.truncate(self.desired_headers);
            self.accumulating = false;
            let all = self.headers.clone();
            self.emit(SliceEvent::Splice {
                index: 0,
                remove_count: 0,
                added: all,
                requested,
                more_expected,
            });
        }
        self.emit(SliceEvent::Status {
            status,
            requested,
            more_expected,
        });
    }

    /// Store and publish new position flags
    pub fn update_flags(&mut self, flags: SliceFlags) {
        if self.is_dead() {
            return;
        }
        self.flags = flags;
        self.emit(SliceEvent::Flags(flags));
    }

    /// Throw away all content before turning a refresh into a full sync
    pub fn reset_headers(&mut self) {
        if self.headers.is_empty() {
            return;
        }
        let count = self.headers.len();
        self.headers.clear();
        if !self.accumulating {
            self.emit(SliceEvent::Splice {
                index: 0,
                remove_count: count,
                added: Vec::new(),
                requested: false,
                more_expected: true,
            });
        }
    }

    /// Drop headers collected in accumulate mode without showing them
    pub fn discard_accumulated(&mut self) {
        if self.accumulating {
            self.headers.clear();
            self.accumulating = false;
        }
    }

    /// Stop delivering events. Storage forgets the slice separately.
    pub fn die(&mut self) {
        self.consumer = None;
    }
}

impl fmt::Debug for MailSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailSlice")
            .field("id", &self.id)
            .field("len", &self.headers.len())
            .field("desired_headers", &self.desired_headers)
            .field("accumulating", &self.accumulating)
            .field("flags", &self.flags)
            .field("dead", &self.is_dead())
            .finish()
    }
}
