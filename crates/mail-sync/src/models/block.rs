//! Block index entries and block contents

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Keyed, SortKey};

/// Identifier of a block within one family of one folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two independent block families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Header,
    Body,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Header => "header",
            BlockKind::Body => "body",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index entry describing one block.
///
/// `start` is the oldest entry in the block and `end` the newest, so the
/// block covers every key `k` with `end_key() <= k <= start_key()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub start_ts: i64,
    pub start_id: u64,
    pub end_ts: i64,
    pub end_id: u64,
    pub count: usize,
    pub est_size: usize,
}

impl BlockInfo {
    /// Info for a fresh, empty block positioned at `key`
    pub fn at(block_id: BlockId, key: SortKey) -> Self {
        Self {
            block_id,
            start_ts: key.date,
            start_id: key.id,
            end_ts: key.date,
            end_id: key.id,
            count: 0,
            est_size: 0,
        }
    }

    pub fn start_key(&self) -> SortKey {
        SortKey::new(self.start_ts, self.start_id)
    }

    pub fn end_key(&self) -> SortKey {
        SortKey::new(self.end_ts, self.end_id)
    }

    pub fn set_start(&mut self, key: SortKey) {
        self.start_ts = key.date;
        self.start_id = key.id;
    }

    pub fn set_end(&mut self, key: SortKey) {
        self.end_ts = key.date;
        self.end_id = key.id;
    }

    pub fn contains(&self, key: SortKey) -> bool {
        self.end_key() <= key && key <= self.start_key()
    }
}

/// Contents of a block: entries in listing order (newest first)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block<E> {
    pub entries: Vec<E>,
}

impl<E> Default for Block<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<E: Keyed> Block<E> {
    /// Position of `key`: Ok if present, Err with the insertion point if not
    pub fn search(&self, key: SortKey) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.sort_key().cmp(&key))
    }

    pub fn get(&self, key: SortKey) -> Option<&E> {
        self.search(key).ok().map(|idx| &self.entries[idx])
    }
}

pub type HeaderBlock = Block<super::HeaderInfo>;
pub type BodyBlock = Block<super::BodyInfo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_info_contains() {
        let mut info = BlockInfo::at(BlockId(1), SortKey::new(100, 1));
        info.set_end(SortKey::new(300, 5));
        assert!(info.contains(SortKey::new(200, 2)));
        assert!(info.contains(SortKey::new(100, 1)));
        assert!(info.contains(SortKey::new(300, 5)));
        assert!(!info.contains(SortKey::new(300, 6)));
        assert!(!info.contains(SortKey::new(100, 0)));
    }

    #[test]
    fn test_block_info_serde_shape() {
        let info = BlockInfo::at(BlockId(3), SortKey::new(10, 2));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["blockId"], 3);
        assert_eq!(json["startTs"], 10);
        assert_eq!(json["estSize"], 0);
    }
}
