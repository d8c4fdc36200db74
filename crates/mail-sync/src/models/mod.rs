//! Domain models for folders, messages and their storage units

mod accuracy;
mod block;
mod body;
mod folder;
mod header;
mod pending;

pub use accuracy::AccuracyRange;
pub use block::{Block, BlockId, BlockInfo, BlockKind, BodyBlock, HeaderBlock};
pub use body::{AttachmentInfo, BodyInfo, BodyRep, BodyRepKind, RemoteBody};
pub use folder::{FolderMeta, FolderType, PersistedFolderInfo};
pub use header::{
    EmailAddress, HeaderBuilder, HeaderInfo, Keyed, RemoteHeader, ServerId, SortKey, flags,
};
pub use pending::PendingFlagEdits;
