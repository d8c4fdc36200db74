//! Sync engine for bringing date ranges of a folder up to date
//!
//! A pass searches a window on the server, bisecting it while it holds too
//! many messages, then reconciles storage with what it found. Passes are
//! idempotent and can be safely retried.

mod connection;
mod coordinator;
pub mod fake;
mod parallel;
mod syncer;
pub mod timing;

pub use connection::{ConnectionError, FetchedMessage, FolderConnection, RemoteFlags};
pub use coordinator::{
    BisectDecision, BisectInfo, PassOutcome, SyncCoordinator, SyncError, SyncReport, SyncState,
};
pub use fake::{FakeFolderConnection, FakeOp};
pub use parallel::refresh_folders;
pub use syncer::FolderSyncer;
