//! Size-bounded blocks of headers or bodies, kept in listing order
//!
//! A folder's messages live in blocks: contiguous runs of entries in listing
//! order (newest first) whose estimated size stays under a byte target. The
//! block index (`BlockInfo` list, newest block first) is always in memory;
//! block contents are loaded from the `MailDb` the first time they are
//! touched and can be dropped again while clean.
//!
//! Blocks never overlap. An insert goes into the block whose range covers the
//! new key, or into a neighbour with room; a block over the target is split
//! in two. Emptied blocks are deleted, underfull neighbours are not merged.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::MailDb;
use super::invariant::violation;
use crate::config::StorageConfig;
use crate::models::{Block, BlockId, BlockInfo, BlockKind, BodyInfo, HeaderInfo, Keyed, SortKey};

/// An entry type that can live in a block family
pub trait StoredEntry: Keyed + Clone + Send {
    const KIND: BlockKind;

    /// Estimated bytes this entry adds to its block
    fn estimated_size(&self, config: &StorageConfig) -> usize;

    fn load_block(db: &dyn MailDb, folder_id: &str, block_id: BlockId) -> Result<Option<Block<Self>>>;
}

impl StoredEntry for HeaderInfo {
    const KIND: BlockKind = BlockKind::Header;

    fn estimated_size(&self, config: &StorageConfig) -> usize {
        config.header_est_size
    }

    fn load_block(db: &dyn MailDb, folder_id: &str, block_id: BlockId) -> Result<Option<Block<Self>>> {
        db.load_header_block(folder_id, block_id)
    }
}

impl StoredEntry for BodyInfo {
    const KIND: BlockKind = BlockKind::Body;

    fn estimated_size(&self, _config: &StorageConfig) -> usize {
        self.size
    }

    fn load_block(db: &dyn MailDb, folder_id: &str, block_id: BlockId) -> Result<Option<Block<Self>>> {
        db.load_body_block(folder_id, block_id)
    }
}

/// One family of blocks (headers or bodies) for one folder
pub struct BlockStore<E: StoredEntry> {
    folder_id: String,
    db: Arc<dyn MailDb>,
    config: StorageConfig,
    /// Newest block first
    infos: Vec<BlockInfo>,
    resident: HashMap<BlockId, Block<E>>,
    /// Dirty ids; an id that is no longer resident is a deleted block
    dirty: BTreeSet<BlockId>,
    next_block_id: u64,
    blocks_created: usize,
}

impl<E: StoredEntry> BlockStore<E> {
    /// Reopen a family from its persisted index
    pub fn new(
        folder_id: impl Into<String>,
        db: Arc<dyn MailDb>,
        config: StorageConfig,
        infos: Vec<BlockInfo>,
    ) -> Self {
        let next_block_id = infos.iter().map(|i| i.block_id.0 + 1).max().unwrap_or(0);
        Self {
            folder_id: folder_id.into(),
            db,
            config,
            infos,
            resident: HashMap::new(),
            dirty: BTreeSet::new(),
            next_block_id,
            blocks_created: 0,
        }
    }

    /// The block index, newest block first
    pub fn infos(&self) -> &[BlockInfo] {
        &self.infos
    }

    pub fn block_count(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Total number of entries across all blocks
    pub fn entry_count(&self) -> usize {
        self.infos.iter().map(|i| i.count).sum()
    }

    /// Key of the newest entry
    pub fn youngest_key(&self) -> Option<SortKey> {
        self.infos.first().map(BlockInfo::end_key)
    }

    /// Key of the oldest entry
    pub fn oldest_key(&self) -> Option<SortKey> {
        self.infos.last().map(BlockInfo::start_key)
    }

    pub fn has_dirty_blocks(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Blocks created by splits or inserts since the last call
    pub fn take_blocks_created(&mut self) -> usize {
        std::mem::take(&mut self.blocks_created)
    }

    /// Index of the block that covers `key`, or where a block for it would go.
    ///
    /// The second value is true when the block at the index covers the key.
    fn find_block(&self, key: SortKey) -> (usize, bool) {
        let idx = self.infos.partition_point(|info| info.start_key() < key);
        let covered = idx < self.infos.len() && self.infos[idx].end_key() <= key;
        (idx, covered)
    }

    fn ensure_resident(&mut self, idx: usize) -> Result<BlockId> {
        let block_id = self.infos[idx].block_id;
        if !self.resident.contains_key(&block_id) {
            let block = E::load_block(self.db.as_ref(), &self.folder_id, block_id)?.ok_or_else(|| {
                violation(format!(
                    "{} block {} of {} is indexed but missing from the store",
                    E::KIND,
                    block_id,
                    self.folder_id
                ))
            })?;
            log::trace!("Loaded {} block {} of {}", E::KIND, block_id, self.folder_id);
            self.resident.insert(block_id, block);
        }
        Ok(block_id)
    }

    fn block_at(&mut self, idx: usize) -> Result<&Block<E>> {
        let block_id = self.ensure_resident(idx)?;
        Ok(&self.resident[&block_id])
    }

    fn allocate_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.blocks_created += 1;
        id
    }

    /// Insert a new entry in listing order. Returns the block it landed in.
    pub fn insert(&mut self, entry: E) -> Result<BlockId> {
        let key = entry.sort_key();
        let cost = entry.estimated_size(&self.config);
        let max = self.config.max_block_size;

        let (found, covered) = self.find_block(key);
        let idx = if covered {
            found
        } else if self.infos.is_empty() {
            let block_id = self.allocate_block();
            self.infos.push(BlockInfo::at(block_id, key));
            self.resident.insert(block_id, Block::default());
            0
        } else {
            // The key falls between blocks: prefer whichever neighbour has room
            let len = self.infos.len();
            let idx = if found < len && self.infos[found].est_size + cost < max {
                found
            } else if found > 0 && self.infos[found - 1].est_size + cost < max {
                found - 1
            } else if found == len || (found > 0 && found < len / 2) {
                found - 1
            } else {
                found
            };
            let info = &mut self.infos[idx];
            if key < info.end_key() {
                info.set_end(key);
            }
            if key > info.start_key() {
                info.set_start(key);
            }
            idx
        };

        let block_id = self.ensure_resident(idx)?;
        let block = self
            .resident
            .get_mut(&block_id)
            .ok_or_else(|| violation(format!("block {} vanished during insert", block_id)))?;
        let pos = match block.search(key) {
            Ok(_) => {
                return Err(violation(format!(
                    "duplicate {} entry {:?} in {}",
                    E::KIND,
                    key,
                    self.folder_id
                )));
            }
            Err(pos) => pos,
        };
        block.entries.insert(pos, entry);

        let info = &mut self.infos[idx];
        info.count += 1;
        info.est_size += cost;
        self.dirty.insert(block_id);

        if info.est_size >= max && info.count > 1 {
            let newer_target = self.newer_split_target(idx, pos);
            self.split_block(idx, newer_target)?;
            let (idx, _) = self.find_block(key);
            return Ok(self.infos[idx].block_id);
        }
        Ok(block_id)
    }

    /// Byte target for the newer half of a split.
    ///
    /// Appending past the oldest entry of the oldest block (backfill) keeps
    /// most entries in the newer half so the older one has room to grow;
    /// prepending to the newest block (new mail) does the opposite.
    fn newer_split_target(&self, idx: usize, pos: usize) -> usize {
        let max = self.config.max_block_size;
        let info = &self.infos[idx];
        if idx + 1 == self.infos.len() && pos + 1 == info.count {
            max * 2 / 3
        } else if idx == 0 && pos == 0 {
            max / 3
        } else {
            max / 2
        }
    }

    fn split_block(&mut self, idx: usize, newer_target: usize) -> Result<()> {
        let block_id = self.ensure_resident(idx)?;
        let newer_id = block_id;
        let older_id = self.allocate_block();

        let (older_entries, newer_size, older_size, newer_start, older_end) = {
            let config = &self.config;
            let block = self
                .resident
                .get_mut(&block_id)
                .ok_or_else(|| violation(format!("block {} vanished during split", block_id)))?;
            let count = block.entries.len();

            let mut newer_size = 0;
            let mut take = 0;
            for entry in &block.entries {
                if take > 0 && newer_size >= newer_target {
                    break;
                }
                newer_size += entry.estimated_size(config);
                take += 1;
            }
            let take = take.clamp(1, count - 1);

            let older_entries = block.entries.split_off(take);
            let newer_size: usize = block.entries.iter().map(|e| e.estimated_size(config)).sum();
            let older_size: usize = older_entries.iter().map(|e| e.estimated_size(config)).sum();
            let newer_start = block.entries[take - 1].sort_key();
            let older_end = older_entries[0].sort_key();
            (older_entries, newer_size, older_size, newer_start, older_end)
        };

        let old_info = self.infos[idx].clone();
        let mut older_info = BlockInfo::at(older_id, old_info.start_key());
        older_info.set_end(older_end);
        older_info.count = older_entries.len();
        older_info.est_size = older_size;

        let newer_info = &mut self.infos[idx];
        newer_info.set_start(newer_start);
        newer_info.count = old_info.count - older_info.count;
        newer_info.est_size = newer_size;

        log::debug!(
            "Split {} block {} of {}: {} newer / {} older entries (new block {})",
            E::KIND,
            newer_id,
            self.folder_id,
            newer_info.count,
            older_info.count,
            older_id
        );

        self.infos.insert(idx + 1, older_info);
        self.resident.insert(
            older_id,
            Block {
                entries: older_entries,
            },
        );
        self.dirty.insert(newer_id);
        self.dirty.insert(older_id);

        let max = self.config.max_block_size;
        if self.infos[idx + 1].est_size > max && self.infos[idx + 1].count > 1 {
            self.split_block(idx + 1, max / 2)?;
        }
        if self.infos[idx].est_size > max && self.infos[idx].count > 1 {
            self.split_block(idx, max / 2)?;
        }
        Ok(())
    }

    /// Remove an entry that must exist
    pub fn remove(&mut self, key: SortKey) -> Result<E> {
        match self.remove_if_present(key)? {
            Some(entry) => Ok(entry),
            None => Err(violation(format!(
                "no {} entry {:?} in {} to remove",
                E::KIND,
                key,
                self.folder_id
            ))),
        }
    }

    /// Remove an entry if it is stored
    pub fn remove_if_present(&mut self, key: SortKey) -> Result<Option<E>> {
        let (idx, covered) = self.find_block(key);
        if !covered {
            return Ok(None);
        }
        let block_id = self.ensure_resident(idx)?;
        let Some(block) = self.resident.get_mut(&block_id) else {
            return Ok(None);
        };
        let Ok(pos) = block.search(key) else {
            return Ok(None);
        };
        let entry = block.entries.remove(pos);
        let cost = entry.estimated_size(&self.config);

        if block.entries.is_empty() {
            self.infos.remove(idx);
            self.resident.remove(&block_id);
            log::debug!("Deleted empty {} block {} of {}", E::KIND, block_id, self.folder_id);
        } else {
            let newest = block.entries[0].sort_key();
            let oldest = block.entries[block.entries.len() - 1].sort_key();
            let info = &mut self.infos[idx];
            info.count -= 1;
            info.est_size = info.est_size.saturating_sub(cost);
            info.set_end(newest);
            info.set_start(oldest);
        }
        self.dirty.insert(block_id);
        Ok(Some(entry))
    }

    /// Look up one entry
    pub fn get(&mut self, key: SortKey) -> Result<Option<E>> {
        let (idx, covered) = self.find_block(key);
        if !covered {
            return Ok(None);
        }
        Ok(self.block_at(idx)?.get(key).cloned())
    }

    /// Mutate an entry in place. `mutate` returns whether it changed anything.
    ///
    /// Returns None when the entry isn't stored. The mutation must not move
    /// the entry: changing its date or id is refused.
    pub fn update<F>(&mut self, key: SortKey, mutate: F) -> Result<Option<bool>>
    where
        F: FnOnce(&mut E) -> bool,
    {
        let (idx, covered) = self.find_block(key);
        if !covered {
            return Ok(None);
        }
        let block_id = self.ensure_resident(idx)?;
        let config = &self.config;
        let Some(block) = self.resident.get_mut(&block_id) else {
            return Ok(None);
        };
        let Ok(pos) = block.search(key) else {
            return Ok(None);
        };

        let mut updated = block.entries[pos].clone();
        let old_size = updated.estimated_size(config);
        if !mutate(&mut updated) {
            return Ok(Some(false));
        }
        if updated.sort_key() != key {
            return Err(violation(format!(
                "update would move {} entry {:?} to {:?}",
                E::KIND,
                key,
                updated.sort_key()
            )));
        }
        let new_size = updated.estimated_size(config);
        block.entries[pos] = updated;

        let info = &mut self.infos[idx];
        info.est_size = info.est_size.saturating_sub(old_size) + new_size;
        self.dirty.insert(block_id);

        if info.est_size > self.config.max_block_size && info.count > 1 {
            self.split_block(idx, self.config.max_block_size / 2)?;
        }
        Ok(Some(true))
    }

    /// Entries dated within `[start_ts, end_ts)`, newest first.
    ///
    /// Either bound may be open. At most `limit` entries are returned.
    pub fn range(&mut self, start_ts: Option<i64>, end_ts: Option<i64>, limit: usize) -> Result<Vec<E>> {
        let mut out = Vec::new();
        for idx in 0..self.infos.len() {
            if out.len() >= limit {
                break;
            }
            let info = &self.infos[idx];
            if end_ts.is_some_and(|end| info.start_ts >= end) {
                continue;
            }
            if start_ts.is_some_and(|start| info.end_ts < start) {
                break;
            }
            for entry in &self.block_at(idx)?.entries {
                let date = entry.sort_key().date;
                if end_ts.is_some_and(|end| date >= end) {
                    continue;
                }
                if start_ts.is_some_and(|start| date < start) {
                    break;
                }
                out.push(entry.clone());
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Up to `limit` entries strictly older than `key`, newest first
    pub fn older_than(&mut self, key: SortKey, limit: usize) -> Result<Vec<E>> {
        let mut out = Vec::new();
        let start = self.find_block(key).0;
        for idx in start..self.infos.len() {
            for entry in &self.block_at(idx)?.entries {
                if entry.sort_key() > key {
                    out.push(entry.clone());
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Up to `limit` entries strictly newer than `key`, newest first.
    ///
    /// These are the entries immediately preceding `key` in listing order.
    pub fn newer_than(&mut self, key: SortKey, limit: usize) -> Result<Vec<E>> {
        let mut out = Vec::new();
        if self.infos.is_empty() {
            return Ok(out);
        }
        let (found, _) = self.find_block(key);
        let start = found.min(self.infos.len() - 1);
        for idx in (0..=start).rev() {
            for entry in self.block_at(idx)?.entries.iter().rev() {
                if entry.sort_key() < key {
                    out.push(entry.clone());
                    if out.len() >= limit {
                        out.reverse();
                        return Ok(out);
                    }
                }
            }
        }
        out.reverse();
        Ok(out)
    }

    /// Remove the oldest block wholesale, returning its entries
    pub fn pop_oldest(&mut self) -> Result<Option<(BlockInfo, Vec<E>)>> {
        if self.infos.is_empty() {
            return Ok(None);
        }
        let idx = self.infos.len() - 1;
        let block_id = self.ensure_resident(idx)?;
        let info = self.infos.remove(idx);
        let entries = self
            .resident
            .remove(&block_id)
            .map(|b| b.entries)
            .unwrap_or_default();
        self.dirty.insert(block_id);
        Ok(Some((info, entries)))
    }

    /// Take the dirty set: `Some(block)` to write, `None` to delete
    pub fn flush_dirty(&mut self) -> BTreeMap<BlockId, Option<Block<E>>> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .map(|id| (id, self.resident.get(&id).cloned()))
            .collect()
    }

    /// Put ids back in the dirty set after a failed write
    pub fn requeue_dirty(&mut self, ids: impl IntoIterator<Item = BlockId>) {
        self.dirty.extend(ids);
    }

    /// Drop clean blocks from memory; they reload on next access
    pub fn release_clean(&mut self) -> usize {
        let before = self.resident.len();
        let dirty = &self.dirty;
        self.resident.retain(|id, _| dirty.contains(id));
        before - self.resident.len()
    }

    /// Number of blocks currently held in memory
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Check that entries are in listing order and blocks don't overlap
    #[cfg(test)]
    pub(crate) fn check_consistency(&mut self) -> Result<()> {
        let mut prev: Option<SortKey> = None;
        for idx in 0..self.infos.len() {
            let info = self.infos[idx].clone();
            let block = self.block_at(idx)?;
            assert_eq!(block.entries.len(), info.count, "count of block {}", info.block_id);
            assert!(!block.entries.is_empty(), "empty block {}", info.block_id);
            assert_eq!(block.entries[0].sort_key(), info.end_key());
            assert_eq!(block.entries[block.entries.len() - 1].sort_key(), info.start_key());
            for entry in &block.entries {
                let key = entry.sort_key();
                if let Some(prev) = prev {
                    assert!(prev < key, "{:?} not before {:?}", prev, key);
                }
                prev = Some(key);
            }
        }
        Ok(())
    }

    /// All entries in listing order
    #[cfg(test)]
    pub(crate) fn all_entries(&mut self) -> Result<Vec<E>> {
        self.range(None, None, usize::MAX)
    }

    #[cfg(test)]
    pub(crate) fn size_of_entries(&self, entries: &[E]) -> usize {
        entries.iter().map(|e| e.estimated_size(&self.config)).sum()
    }
}
