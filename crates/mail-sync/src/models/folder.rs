//! Folder identity and the per-folder state persisted between runs

use serde::{Deserialize, Serialize};

use super::{AccuracyRange, BlockInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    Inbox,
    #[default]
    Normal,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
}

/// Folder metadata owned by the account layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderMeta {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub folder_type: FolderType,
}

impl FolderMeta {
    pub fn new(id: impl Into<String>, name: impl Into<String>, folder_type: FolderType) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            path: name.clone(),
            name,
            folder_type,
        }
    }

    pub fn is_inbox(&self) -> bool {
        self.folder_type == FolderType::Inbox
    }
}

/// Everything needed to reopen a folder's storage after a restart
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedFolderInfo {
    pub next_header_id: u64,
    pub accuracy_ranges: Vec<AccuracyRange>,
    pub header_block_index: Vec<BlockInfo>,
    pub body_block_index: Vec<BlockInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockId, SortKey};

    #[test]
    fn test_persisted_info_roundtrip() {
        let info = PersistedFolderInfo {
            next_header_id: 42,
            accuracy_ranges: vec![AccuracyRange {
                start_ts: 10,
                end_ts: 20,
                full_sync: true,
                synced_at: 30,
                sync_token: Some("77".to_string()),
            }],
            header_block_index: vec![BlockInfo::at(BlockId(0), SortKey::new(15, 1))],
            body_block_index: vec![],
        };

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"nextHeaderId\":42"));
        assert!(json.contains("\"accuracyRanges\""));
        assert!(json.contains("\"headerBlockIndex\""));
        assert!(json.contains("\"bodyBlockIndex\""));

        let back: PersistedFolderInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_folder_type_serde() {
        let meta = FolderMeta::new("f1", "INBOX", FolderType::Inbox);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "inbox");
        assert!(meta.is_inbox());
    }
}
