//! Action handler for local flag edits
//!
//! Edits are applied to storage at once and remembered as pending until the
//! server reports the same state, so a sync never reverts them.

use anyhow::{Result, anyhow};
use log::info;

use crate::models::{PendingFlagEdits, flags};
use crate::storage::FolderStorage;

/// Handler for flag actions like read/unread and star
///
/// Actions are performed in two steps:
/// 1. Update the stored header, which notifies any slice showing it
/// 2. Record the edit as pending so reconciliation keeps it
pub struct ActionHandler<'a> {
    storage: &'a mut FolderStorage,
}

impl<'a> ActionHandler<'a> {
    pub fn new(storage: &'a mut FolderStorage) -> Self {
        Self { storage }
    }

    /// Set or clear any flag on a message.
    ///
    /// Returns whether the stored header changed.
    pub fn set_flag(&mut self, date: i64, id: u64, flag: &str, on: bool) -> Result<bool> {
        info!(
            "{} {} on message {} in {}",
            if on { "Setting" } else { "Clearing" },
            flag,
            id,
            self.storage.folder_id()
        );
        self.storage.set_local_flag(date, id, flag, on)
    }

    /// Mark a message as read or unread
    pub fn set_read(&mut self, date: i64, id: u64, is_read: bool) -> Result<bool> {
        self.set_flag(date, id, flags::SEEN, is_read)
    }

    /// Toggle read status for a message
    ///
    /// Returns the new read state (true = read, false = unread).
    pub fn toggle_read(&mut self, date: i64, id: u64) -> Result<bool> {
        let new_is_read = !self.has_flag(date, id, flags::SEEN)?;
        self.set_read(date, id, new_is_read)?;
        Ok(new_is_read)
    }

    pub fn set_starred(&mut self, date: i64, id: u64, starred: bool) -> Result<bool> {
        self.set_flag(date, id, flags::FLAGGED, starred)
    }

    /// Toggle star status for a message
    ///
    /// Returns the new starred state (true = starred, false = unstarred).
    pub fn toggle_star(&mut self, date: i64, id: u64) -> Result<bool> {
        let new_starred = !self.has_flag(date, id, flags::FLAGGED)?;
        self.set_starred(date, id, new_starred)?;
        Ok(new_starred)
    }

    /// The server accepted the edit to `flag`; stop holding it
    pub fn acknowledge(&mut self, id: u64, flag: &str) {
        self.storage.acknowledge_flag(id, flag);
    }

    /// Edits on a message the server has not confirmed yet
    pub fn pending(&self, id: u64) -> Option<&PendingFlagEdits> {
        self.storage.pending_flag_edits(id)
    }

    fn has_flag(&mut self, date: i64, id: u64, flag: &str) -> Result<bool> {
        let header = self
            .storage
            .get_message_header(date, id)?
            .ok_or_else(|| anyhow!("No message {} in {}", id, self.storage.folder_id()))?;
        Ok(header.has_flag(flag))
    }
}
