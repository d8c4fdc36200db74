//! The server side of a folder sync

use std::collections::BTreeSet;

use crate::date::DateWindow;
use crate::models::{RemoteBody, RemoteHeader, ServerId};

/// Errors from a folder connection.
///
/// An empty result is never an error: a search that finds nothing returns
/// an empty list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The request failed but may succeed if retried later
    #[error("connection failed: {0}")]
    Transient(String),
    #[error("server timed out")]
    Timeout,
    /// The server no longer accepts our sync token or cached state
    #[error("server rejected sync state: {0}")]
    BadSyncState(String),
}

/// A message as fetched in full: header fields plus body
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub header: RemoteHeader,
    pub body: RemoteBody,
}

/// Current flags of a message the server already told us about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFlags {
    pub server_id: ServerId,
    pub flags: BTreeSet<String>,
}

/// One folder on the server.
///
/// Implementations are not retried by the sync engine; a failed call ends
/// the pass.
pub trait FolderConnection: Send {
    /// Ids of every message dated within the window
    fn search(&mut self, window: &DateWindow) -> Result<Vec<ServerId>, ConnectionError>;

    fn fetch_full(&mut self, ids: &[ServerId]) -> Result<Vec<FetchedMessage>, ConnectionError>;

    fn fetch_flags(&mut self, ids: &[ServerId]) -> Result<Vec<RemoteFlags>, ConnectionError>;

    /// Number of messages in the folder, if the server reports it
    fn total_messages(&self) -> Option<usize> {
        None
    }

    /// Server change marker to store alongside synced ranges
    fn sync_token(&self) -> Option<String> {
        None
    }
}
