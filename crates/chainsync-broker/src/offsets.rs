//! Commit watermarks for partitions consumed by concurrent workers.
//!
//! Workers acknowledge records in any order. A partition's offset may only
//! be committed up to its lowest record that is still in flight, otherwise a
//! restart would skip that record. The tracker keeps, per partition, the
//! delivered-but-unacknowledged offsets and hands back the next commit
//! position whenever the acknowledged prefix grows.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct PartitionState {
    in_flight: BTreeSet<i64>,
    highest_acked: Option<i64>,
    /// Next offset the group resumes from, as last committed (or as first seen).
    committed: i64,
}

impl PartitionState {
    fn starting_at(offset: i64) -> Self {
        Self {
            committed: offset,
            ..Self::default()
        }
    }

    fn watermark(&self) -> Option<i64> {
        match self.in_flight.first() {
            Some(&lowest) => Some(lowest),
            None => self.highest_acked.map(|acked| acked + 1),
        }
    }
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionState>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `offset` as handed out. Redeliveries of a pending offset are no-ops.
    pub fn delivered(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.lock();
        partitions
            .entry((topic.to_string(), partition))
            .or_insert_with(|| PartitionState::starting_at(offset))
            .in_flight
            .insert(offset);
    }

    /// Mark `offset` done. Returns the offset to commit when the contiguous
    /// acknowledged prefix moved forward.
    pub fn acked(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.lock();
        let state = partitions.get_mut(&(topic.to_string(), partition))?;
        state.in_flight.remove(&offset);
        state.highest_acked = Some(state.highest_acked.map_or(offset, |h| h.max(offset)));

        let next = state.watermark()?;
        if next <= state.committed {
            return None;
        }
        state.committed = next;
        if state.in_flight.is_empty() {
            state.highest_acked = None;
        }
        Some(next)
    }

    /// Drop the state of a partition this consumer no longer owns.
    pub fn forget(&self, topic: &str, partition: i32) {
        self.lock().remove(&(topic.to_string(), partition));
    }

    /// Offsets still awaiting acknowledgement on `partition`.
    pub fn pending(&self, topic: &str, partition: i32) -> usize {
        self.lock()
            .get(&(topic.to_string(), partition))
            .map_or(0, |state| state.in_flight.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, i32), PartitionState>> {
        self.partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(tracker: &OffsetTracker, offsets: std::ops::Range<i64>) {
        for offset in offsets {
            tracker.delivered("blocks", 0, offset);
        }
    }

    #[test]
    fn in_order_acks_commit_each_step() {
        let tracker = OffsetTracker::new();
        deliver(&tracker, 10..13);
        assert_eq!(tracker.acked("blocks", 0, 10), Some(11));
        assert_eq!(tracker.acked("blocks", 0, 11), Some(12));
        assert_eq!(tracker.acked("blocks", 0, 12), Some(13));
        assert_eq!(tracker.pending("blocks", 0), 0);
    }

    #[test]
    fn out_of_order_ack_waits_for_the_gap() {
        let tracker = OffsetTracker::new();
        deliver(&tracker, 10..13);

        assert_eq!(tracker.acked("blocks", 0, 11), None);
        assert_eq!(tracker.acked("blocks", 0, 12), None);
        // 10 was the hole: everything through 12 is now done
        assert_eq!(tracker.acked("blocks", 0, 10), Some(13));
    }

    #[test]
    fn unacked_record_holds_the_partition() {
        let tracker = OffsetTracker::new();
        deliver(&tracker, 10..14);
        assert_eq!(tracker.acked("blocks", 0, 10), Some(11));
        // 11 nacked: stays in flight until it is redelivered and acked
        assert_eq!(tracker.acked("blocks", 0, 12), None);
        assert_eq!(tracker.acked("blocks", 0, 13), None);
        assert_eq!(tracker.pending("blocks", 0), 1);

        tracker.delivered("blocks", 0, 11);
        assert_eq!(tracker.pending("blocks", 0), 1);
        assert_eq!(tracker.acked("blocks", 0, 11), Some(14));
    }

    #[test]
    fn partitions_are_independent() {
        let tracker = OffsetTracker::new();
        tracker.delivered("blocks", 0, 5);
        tracker.delivered("blocks", 1, 7);
        tracker.delivered("requests", 0, 5);
        assert_eq!(tracker.acked("blocks", 1, 7), Some(8));
        assert_eq!(tracker.pending("blocks", 0), 1);
        assert_eq!(tracker.pending("requests", 0), 1);
    }

    #[test]
    fn forgotten_partition_starts_over() {
        let tracker = OffsetTracker::new();
        deliver(&tracker, 10..12);
        tracker.forget("blocks", 0);
        assert_eq!(tracker.acked("blocks", 0, 11), None);

        tracker.delivered("blocks", 0, 40);
        assert_eq!(tracker.acked("blocks", 0, 40), Some(41));
    }

    #[test]
    fn unknown_partition_commits_nothing() {
        let tracker = OffsetTracker::new();
        assert_eq!(tracker.acked("blocks", 3, 1), None);
    }
}
