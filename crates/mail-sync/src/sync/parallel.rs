//! Refreshing many folders at once

use rayon::prelude::*;

use super::connection::FolderConnection;
use super::coordinator::{SyncError, SyncReport};
use crate::folder::MailFolder;

/// Sync the recent days of every folder in parallel.
///
/// Folders share nothing but their database handle, so each runs on its own
/// worker. Results come back in the order of `folders`; one folder failing
/// does not stop the others.
pub fn refresh_folders<C: FolderConnection>(
    folders: &mut [MailFolder<C>],
) -> Vec<Result<SyncReport, SyncError>> {
    folders
        .par_iter_mut()
        .map(|folder| {
            let result = folder.sync_recent();
            match &result {
                Ok(report) => log::debug!(
                    "Refreshed {}: {} new, {} deleted",
                    folder.storage().folder_id(),
                    report.new_count,
                    report.deleted_count
                ),
                Err(e) => log::warn!("Refresh of {} failed: {}", folder.storage().folder_id(), e),
            }
            result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::date::HOUR_MILLIS;
    use crate::models::{FolderMeta, FolderType};
    use crate::storage::InMemoryMailDb;
    use crate::sync::{ConnectionError, FakeFolderConnection, FakeOp};
    use std::sync::Arc;

    /// 2024-03-09T12:00:00Z
    const NOW: i64 = 1_709_985_600_000;

    fn fixed_now() -> i64 {
        NOW
    }

    #[test]
    fn test_one_failure_does_not_stop_others() {
        let db = Arc::new(InMemoryMailDb::new());
        let mut folders: Vec<MailFolder<FakeFolderConnection>> = ["inbox", "work", "lists"]
            .iter()
            .enumerate()
            .map(|(n, name)| {
                let mut conn = FakeFolderConnection::new();
                for i in 0..=n as i64 {
                    conn.add_message(NOW - (i + 1) * HOUR_MILLIS);
                }
                let meta = FolderMeta::new(*name, *name, FolderType::Normal);
                MailFolder::open(meta, db.clone(), &SyncSettings::default(), conn)
                    .unwrap()
                    .with_clock(fixed_now)
            })
            .collect();
        folders[1]
            .connection_mut()
            .fail_next(FakeOp::Search, ConnectionError::Timeout);

        let results = refresh_folders(&mut folders);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().new_count, 1);
        assert!(matches!(results[1], Err(SyncError::Connection(ConnectionError::Timeout))));
        assert_eq!(results[2].as_ref().unwrap().new_count, 3);
        assert_eq!(folders[1].storage().known_message_count(), 0);
    }
}
