//! In-memory MailDb implementation
//!
//! Used by tests and by callers that don't need folder state to survive the
//! process. Commits are counted so tests can check when data became durable.

use anyhow::{Result, bail};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{FlushBatch, MailDb};
use crate::models::{BlockId, BlockKind, BodyBlock, HeaderBlock, PersistedFolderInfo};

type BlockKey = (String, BlockId);

/// In-memory implementation of MailDb
///
/// Uses HashMaps protected by RwLocks for thread-safe access. A commit takes
/// every write lock before touching anything, so readers never observe half
/// of a `put_blocks`.
pub struct InMemoryMailDb {
    folders: RwLock<HashMap<String, PersistedFolderInfo>>,
    header_blocks: RwLock<HashMap<BlockKey, HeaderBlock>>,
    body_blocks: RwLock<HashMap<BlockKey, BodyBlock>>,
    commits: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryMailDb {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            folders: RwLock::new(HashMap::new()),
            header_blocks: RwLock::new(HashMap::new()),
            body_blocks: RwLock::new(HashMap::new()),
            commits: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Number of successful `put_blocks` calls so far
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail, simulating a full or broken disk
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored blocks of one family for a folder
    pub fn block_count(&self, folder_id: &str, kind: BlockKind) -> usize {
        match kind {
            BlockKind::Header => self
                .header_blocks
                .read()
                .unwrap()
                .keys()
                .filter(|(f, _)| f == folder_id)
                .count(),
            BlockKind::Body => self
                .body_blocks
                .read()
                .unwrap()
                .keys()
                .filter(|(f, _)| f == folder_id)
                .count(),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("in-memory store is refusing writes");
        }
        Ok(())
    }
}

impl Default for InMemoryMailDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MailDb for InMemoryMailDb {
    fn load_folder_info(&self, folder_id: &str) -> Result<Option<PersistedFolderInfo>> {
        let folders = self.folders.read().unwrap();
        Ok(folders.get(folder_id).cloned())
    }

    fn load_header_block(&self, folder_id: &str, block_id: BlockId) -> Result<Option<HeaderBlock>> {
        let blocks = self.header_blocks.read().unwrap();
        Ok(blocks.get(&(folder_id.to_string(), block_id)).cloned())
    }

    fn load_body_block(&self, folder_id: &str, block_id: BlockId) -> Result<Option<BodyBlock>> {
        let blocks = self.body_blocks.read().unwrap();
        Ok(blocks.get(&(folder_id.to_string(), block_id)).cloned())
    }

    fn put_blocks(&self, folder_id: &str, batch: &FlushBatch) -> Result<()> {
        self.check_writable()?;

        let mut folders = self.folders.write().unwrap();
        let mut headers = self.header_blocks.write().unwrap();
        let mut bodies = self.body_blocks.write().unwrap();

        for (id, block) in &batch.header_blocks {
            let key = (folder_id.to_string(), *id);
            match block {
                Some(block) => {
                    headers.insert(key, block.clone());
                }
                None => {
                    headers.remove(&key);
                }
            }
        }
        for (id, block) in &batch.body_blocks {
            let key = (folder_id.to_string(), *id);
            match block {
                Some(block) => {
                    bodies.insert(key, block.clone());
                }
                None => {
                    bodies.remove(&key);
                }
            }
        }
        folders.insert(folder_id.to_string(), batch.info.clone());

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_blocks(&self, folder_id: &str, kind: BlockKind, block_ids: &[BlockId]) -> Result<()> {
        self.check_writable()?;
        match kind {
            BlockKind::Header => {
                let mut blocks = self.header_blocks.write().unwrap();
                for id in block_ids {
                    blocks.remove(&(folder_id.to_string(), *id));
                }
            }
            BlockKind::Body => {
                let mut blocks = self.body_blocks.write().unwrap();
                for id in block_ids {
                    blocks.remove(&(folder_id.to_string(), *id));
                }
            }
        }
        Ok(())
    }

    fn delete_folder(&self, folder_id: &str) -> Result<()> {
        self.check_writable()?;
        self.folders.write().unwrap().remove(folder_id);
        self.header_blocks
            .write()
            .unwrap()
            .retain(|(f, _), _| f != folder_id);
        self.body_blocks
            .write()
            .unwrap()
            .retain(|(f, _), _| f != folder_id);
        Ok(())
    }
}
