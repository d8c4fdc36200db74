//! Events a slice sends to whoever displays it

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::models::HeaderInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    Synchronizing,
    Synced,
    SyncFailed,
}

/// Where a slice sits relative to everything the folder knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceFlags {
    /// The slice starts at the newest known message
    pub at_top: bool,
    /// The slice ends at the oldest message and nothing older exists
    pub at_bottom: bool,
    /// Nothing older is stored, but the server may still have more
    pub user_can_grow_downwards: bool,
}

/// A change to a slice's header list or state.
///
/// Splices and updates use indices into the list as the consumer has it
/// after applying every earlier event, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SliceEvent {
    Splice {
        index: usize,
        remove_count: usize,
        added: Vec<HeaderInfo>,
        /// The change answers a request from the consumer
        requested: bool,
        /// More events for the same request follow
        more_expected: bool,
    },
    Update {
        index: usize,
        header: HeaderInfo,
    },
    Status {
        status: SliceStatus,
        requested: bool,
        more_expected: bool,
    },
    Flags(SliceFlags),
}

/// Receives slice events synchronously, in order
pub trait SliceConsumer: Send {
    fn deliver(&mut self, event: SliceEvent);
}

/// Forward events over a channel, e.g. to a UI thread.
/// A dropped receiver silently discards events.
impl SliceConsumer for Sender<SliceEvent> {
    fn deliver(&mut self, event: SliceEvent) {
        let _ = self.send(event);
    }
}

/// Apply one event to a consumer-side copy of the header list
pub fn apply_event(items: &mut Vec<HeaderInfo>, event: &SliceEvent) {
    match event {
        SliceEvent::Splice {
            index,
            remove_count,
            added,
            ..
        } => {
            let end = (*index + *remove_count).min(items.len());
            let start = (*index).min(end);
            items.splice(start..end, added.iter().cloned());
        }
        SliceEvent::Update { index, header } => {
            if let Some(slot) = items.get_mut(*index) {
                *slot = header.clone();
            }
        }
        SliceEvent::Status { .. } | SliceEvent::Flags(_) => {}
    }
}

/// Keeps every event in a shared buffer.
///
/// Clones share the buffer, so one clone can be handed to a slice while
/// another is used to read what was delivered.
#[derive(Debug, Clone, Default)]
pub struct BufferedConsumer {
    events: Arc<Mutex<Vec<SliceEvent>>>,
}

impl BufferedConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event delivered so far
    pub fn events(&self) -> Vec<SliceEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Remove and return the buffered events
    pub fn take_events(&self) -> Vec<SliceEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// The header list a consumer would show after replaying every event
    pub fn mirror(&self) -> Vec<HeaderInfo> {
        let mut items = Vec::new();
        for event in self.events.lock().unwrap().iter() {
            apply_event(&mut items, event);
        }
        items
    }

    pub fn last_status(&self) -> Option<SliceStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|e| match e {
                SliceEvent::Status { status, .. } => Some(*status),
                _ => None,
            })
    }

    pub fn last_flags(&self) -> Option<SliceFlags> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|e| match e {
                SliceEvent::Flags(flags) => Some(*flags),
                _ => None,
            })
    }
}

impl SliceConsumer for BufferedConsumer {
    fn deliver(&mut self, event: SliceEvent) {
        self.events.lock().unwrap().push(event);
    }
}
