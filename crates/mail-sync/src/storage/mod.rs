//! Block storage, sync coverage and the per-folder storage facade
//!
//! `MailDb` is the transactional backend. `BlockStore` keeps one family of
//! size-bounded blocks on top of it, `AccuracyTracker` records which time
//! spans mirror the server, and `FolderStorage` ties both families, the
//! tracker and the bound slices together for one folder.

mod accuracy;
mod block_store;
mod folder_storage;
mod invariant;
mod memory;
mod sqlite;
mod traits;

pub use accuracy::{AccuracyTracker, RefreshGap};
pub use block_store::{BlockStore, StoredEntry};
pub use folder_storage::{FolderStorage, SyncKind, SyncRequest};
pub use invariant::InvariantViolation;
pub use memory::InMemoryMailDb;
pub use sqlite::SqliteMailDb;
pub use traits::{FlushBatch, MailDb};
