//! Storage trait definitions

use std::collections::BTreeMap;

use anyhow::Result;

use crate::models::{BlockId, BlockKind, BodyBlock, HeaderBlock, PersistedFolderInfo};

/// Everything a folder writes in one commit.
///
/// A `None` block is a tombstone: the block was emptied and must be deleted.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    pub info: PersistedFolderInfo,
    pub header_blocks: BTreeMap<BlockId, Option<HeaderBlock>>,
    pub body_blocks: BTreeMap<BlockId, Option<BodyBlock>>,
}

impl FlushBatch {
    /// Number of blocks written or deleted by this batch
    pub fn block_count(&self) -> usize {
        self.header_blocks.len() + self.body_blocks.len()
    }
}

/// Transactional key-value store holding folder metadata and blocks
///
/// Every method is atomic on its own. Implementations must make a
/// `put_blocks` either fully visible or not at all, since the block index
/// in `FlushBatch::info` references the blocks written alongside it.
pub trait MailDb: Send + Sync {
    /// Load the persisted state of a folder, None if never saved
    fn load_folder_info(&self, folder_id: &str) -> Result<Option<PersistedFolderInfo>>;

    fn load_header_block(&self, folder_id: &str, block_id: BlockId) -> Result<Option<HeaderBlock>>;

    fn load_body_block(&self, folder_id: &str, block_id: BlockId) -> Result<Option<BodyBlock>>;

    /// Commit folder info plus dirty blocks in one transaction
    fn put_blocks(&self, folder_id: &str, batch: &FlushBatch) -> Result<()>;

    /// Delete blocks outright
    fn delete_blocks(&self, folder_id: &str, kind: BlockKind, block_ids: &[BlockId]) -> Result<()>;

    /// Drop a folder and all of its blocks
    fn delete_folder(&self, folder_id: &str) -> Result<()>;
}
