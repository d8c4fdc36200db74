//! Mail sync crate - Offline storage and synchronization for mail folders
//!
//! This crate provides the local half of an email client:
//! - Block storage for message headers and bodies, split and merged by size
//! - Accuracy tracking of which time ranges mirror the server
//! - Per-folder storage with live slices that views bind to
//! - A sync engine that bisects dense date ranges and reconciles them
//! - Action handlers for local flag changes (read/unread, star)
//!
//! Server access goes through the `FolderConnection` trait; the crate has no
//! network or UI dependencies of its own.

pub mod actions;
pub mod config;
pub mod date;
pub mod folder;
pub mod models;
pub mod slice;
pub mod storage;
pub mod sync;

pub use actions::ActionHandler;
pub use config::{StorageConfig, SyncConfig, SyncSettings};
pub use date::{DateWindow, OLDEST_SYNC_DATE};
pub use folder::MailFolder;
pub use models::{
    AccuracyRange, BlockInfo, BodyInfo, EmailAddress, FolderMeta, FolderType, HeaderInfo,
    RemoteBody, RemoteHeader, ServerId, SortKey,
};
pub use slice::{BufferedConsumer, GrowDirection, MailSlice, SliceConsumer, SliceEvent, SliceId, SliceStatus};
pub use storage::{
    AccuracyTracker, BlockStore, FolderStorage, InMemoryMailDb, MailDb, SqliteMailDb, SyncKind,
    SyncRequest,
};
pub use sync::{
    // Server side
    ConnectionError, FolderConnection,
    // Running syncs
    FolderSyncer, PassOutcome, SyncCoordinator, SyncError, SyncReport, refresh_folders,
};
