//! Merge of the local and remote record sets
//!
//! Union by id. When both sides hold the same id, the remote copy wins only
//! if its recency marker is strictly greater; ties keep the local copy.
//! Records present on one side only are always kept, so merging never
//! loses a record.

use tracing::debug;

use crate::models::RecordSet;

/// What a merge changed relative to the local set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Remote-only records adopted
    pub added: usize,
    /// Local records replaced by a newer remote copy
    pub replaced: usize,
    /// Records present on both sides where the local copy was kept
    pub kept: usize,
}

impl MergeStats {
    /// Whether the merge changed the local set
    pub fn changed_local(&self) -> bool {
        self.added > 0 || self.replaced > 0
    }
}

/// Merge the remote set into the local one
pub fn merge(local: &RecordSet, remote: &RecordSet) -> RecordSet {
    merge_with_stats(local, remote).0
}

/// Merge and report what changed
pub fn merge_with_stats(local: &RecordSet, remote: &RecordSet) -> (RecordSet, MergeStats) {
    let mut merged = local.clone();
    let mut stats = MergeStats::default();

    for incoming in remote.iter() {
        match merged.get(&incoming.id) {
            None => {
                merged.insert(incoming.clone());
                stats.added += 1;
            }
            Some(existing) if incoming.recency() > existing.recency() => {
                merged.insert(incoming.clone());
                stats.replaced += 1;
            }
            Some(_) => stats.kept += 1,
        }
    }

    debug!(
        local = local.len(),
        remote = remote.len(),
        merged = merged.len(),
        added = stats.added,
        replaced = stats.replaced,
        "Merged record sets"
    );

    (merged, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Record, RecordId};

    fn record(id: i64, english: &str, updated_at: Option<i64>) -> Record {
        let mut record = Record::with_id(RecordId::from_millis(id), english, "");
        record.updated_at = updated_at;
        record
    }

    fn set(records: Vec<Record>) -> RecordSet {
        RecordSet::from_records(records)
    }

    #[test]
    fn test_disjoint_sets_union() {
        let local = set(vec![record(1, "A", None)]);
        let remote = set(vec![record(2, "B", None)]);

        let (merged, stats) = merge_with_stats(&local, &remote);
        assert_eq!(merged.len(), 2);
        assert_eq!(stats.added, 1);
        assert!(stats.changed_local());
    }

    #[test]
    fn test_newer_remote_replaces_local() {
        let local = set(vec![record(1, "Old", Some(100))]);
        let remote = set(vec![record(1, "New", Some(200))]);

        let merged = merge(&local, &remote);
        assert_eq!(merged.get(&RecordId::from_millis(1)).unwrap().english, "New");
    }

    #[test]
    fn test_newer_local_is_kept() {
        let local = set(vec![record(1, "Local", Some(300))]);
        let remote = set(vec![record(1, "Remote", Some(200))]);

        let (merged, stats) = merge_with_stats(&local, &remote);
        assert_eq!(
            merged.get(&RecordId::from_millis(1)).unwrap().english,
            "Local"
        );
        assert_eq!(stats.kept, 1);
        assert!(!stats.changed_local());
    }

    #[test]
    fn test_tie_keeps_local() {
        let local = set(vec![record(1, "Local", Some(500))]);
        let remote = set(vec![record(1, "Remote", Some(500))]);

        let merged = merge(&local, &remote);
        assert_eq!(
            merged.get(&RecordId::from_millis(1)).unwrap().english,
            "Local"
        );
    }

    #[test]
    fn test_missing_marker_falls_back_to_id() {
        // Neither side carries a timestamp: both compare by id, which ties
        let local = set(vec![record(1_700_000_000_000, "Local", None)]);
        let remote = set(vec![record(1_700_000_000_000, "Remote", None)]);
        assert_eq!(
            merge(&local, &remote).iter().next().unwrap().english,
            "Local"
        );

        // An explicit marker beats the id fallback
        let remote = set(vec![record(1_700_000_000_000, "Remote", Some(1_800_000_000_000))]);
        assert_eq!(
            merge(&local, &remote).iter().next().unwrap().english,
            "Remote"
        );
    }

    #[test]
    fn test_merge_with_empty_sides() {
        let records = set(vec![record(1, "A", None), record(2, "B", None)]);
        let empty = RecordSet::new();

        assert_eq!(merge(&records, &empty), records);
        assert_eq!(merge(&empty, &records), records);
        assert!(merge(&empty, &empty).is_empty());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let local = set(vec![record(1, "A", Some(10)), record(2, "B", Some(20))]);
        let remote = set(vec![record(2, "B2", Some(30)), record(3, "C", Some(5))]);

        let once = merge(&local, &remote);
        let twice = merge(&once, &remote);
        assert_eq!(once, twice);
        assert_eq!(merge(&once, &once), once);
    }

    #[test]
    fn test_merge_never_loses_ids() {
        let local = set(vec![record(1, "A", Some(10)), record(2, "B", Some(20))]);
        let remote = set(vec![record(2, "B2", Some(1)), record(3, "C", Some(5))]);

        let merged = merge(&local, &remote);
        for id in local.ids().chain(remote.ids()) {
            assert!(merged.contains(id), "missing {}", id);
        }
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_duplicate_ids_within_remote_are_collapsed() {
        // A remote file written by an older client may repeat an id
        let json = br#"[
            {"id": 1, "english": "First", "chinese": "", "updatedAt": 10},
            {"id": 1, "english": "Second", "chinese": "", "updatedAt": 20}
        ]"#;
        let remote = RecordSet::from_json(json).unwrap();
        assert_eq!(remote.len(), 1);

        let merged = merge(&RecordSet::new(), &remote);
        assert_eq!(merged.iter().next().unwrap().english, "Second");
    }

    #[test]
    fn test_convergence_after_exchange() {
        // Two devices each merge the other's set and end up identical
        let device_a = set(vec![record(1, "A1", Some(10)), record(2, "B-a", Some(40))]);
        let device_b = set(vec![record(2, "B-b", Some(30)), record(3, "C", Some(15))]);

        let a_after = merge(&device_a, &device_b);
        let b_after = merge(&device_b, &a_after);
        assert_eq!(a_after, b_after);
        assert_eq!(
            b_after.get(&RecordId::from_millis(2)).unwrap().english,
            "B-a"
        );
    }
}
