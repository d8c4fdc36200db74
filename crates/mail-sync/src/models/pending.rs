//! Local flag changes waiting for the server to catch up

use std::collections::BTreeSet;

/// Flags set or cleared locally and not yet seen reflected by the server.
///
/// A flag is in at most one of the two sets: the latest local edit wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingFlagEdits {
    set: BTreeSet<String>,
    cleared: BTreeSet<String>,
}

impl PendingFlagEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local edit of `flag`
    pub fn record(&mut self, flag: &str, on: bool) {
        if on {
            self.cleared.remove(flag);
            self.set.insert(flag.to_string());
        } else {
            self.set.remove(flag);
            self.cleared.insert(flag.to_string());
        }
    }

    /// Forget the edit of `flag`, e.g. once the server has applied it
    pub fn acknowledge(&mut self, flag: &str) {
        self.set.remove(flag);
        self.cleared.remove(flag);
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.cleared.is_empty()
    }

    /// True if `flag` has an unacknowledged local edit
    pub fn touches(&self, flag: &str) -> bool {
        self.set.contains(flag) || self.cleared.contains(flag)
    }

    /// Merge server flags with the local edits.
    ///
    /// Flags under local edit keep their local value; every other flag is
    /// taken from the server.
    pub fn reconcile(&self, remote: &BTreeSet<String>) -> BTreeSet<String> {
        let mut merged: BTreeSet<String> = remote
            .iter()
            .filter(|f| !self.cleared.contains(*f))
            .cloned()
            .collect();
        merged.extend(self.set.iter().cloned());
        merged
    }

    /// Drop edits the server now agrees with
    pub fn prune_applied(&mut self, remote: &BTreeSet<String>) {
        self.set.retain(|f| !remote.contains(f));
        self.cleared.retain(|f| remote.contains(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flags;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_local_edit_wins_for_edited_flag_only() {
        let mut edits = PendingFlagEdits::new();
        edits.record(flags::SEEN, true);

        // Server hasn't seen the read yet, but someone flagged it elsewhere
        let remote = set(&[flags::FLAGGED]);
        assert_eq!(edits.reconcile(&remote), set(&[flags::FLAGGED, flags::SEEN]));
    }

    #[test]
    fn test_cleared_flag_stays_cleared() {
        let mut edits = PendingFlagEdits::new();
        edits.record(flags::FLAGGED, false);
        let remote = set(&[flags::FLAGGED, flags::SEEN]);
        assert_eq!(edits.reconcile(&remote), set(&[flags::SEEN]));
    }

    #[test]
    fn test_latest_edit_wins() {
        let mut edits = PendingFlagEdits::new();
        edits.record(flags::SEEN, true);
        edits.record(flags::SEEN, false);
        assert!(edits.touches(flags::SEEN));
        assert_eq!(edits.reconcile(&set(&[flags::SEEN])), set(&[]));

        edits.acknowledge(flags::SEEN);
        assert!(edits.is_empty());
    }

    #[test]
    fn test_prune_applied() {
        let mut edits = PendingFlagEdits::new();
        edits.record(flags::SEEN, true);
        edits.record(flags::FLAGGED, false);

        edits.prune_applied(&set(&[flags::SEEN, flags::FLAGGED]));
        assert!(edits.touches(flags::FLAGGED));
        assert!(!edits.touches(flags::SEEN));

        edits.prune_applied(&set(&[flags::SEEN]));
        assert!(edits.is_empty());
    }
}
