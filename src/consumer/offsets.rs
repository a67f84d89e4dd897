//! Safe-to-commit offset bookkeeping.
//!
//! An offset may only be committed once every lower offset on the same
//! partition has completed successfully. Completions arrive out of order
//! (handlers run concurrently across lanes), so the tracker keeps the
//! in-flight window per partition and surfaces the contiguous done
//! prefix. A failed offset freezes the partition: nothing at or beyond
//! the failure is ever committed, which forces redelivery.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TopicPartition {
    topic: String,
    partition: i32,
}

#[derive(Debug, Default)]
struct PartitionProgress {
    /// offset → completed
    pending: BTreeMap<i64, bool>,
    halted: bool,
}

/// Tracks per-partition completion state for one subscription.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<TopicPartition, PartitionProgress>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn progress(&mut self, topic: &str, partition: i32) -> &mut PartitionProgress {
        self.partitions
            .entry(TopicPartition {
                topic: topic.to_owned(),
                partition,
            })
            .or_default()
    }

    /// Record that `offset` was handed to a swimlane.
    pub fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        self.progress(topic, partition).pending.insert(offset, false);
    }

    /// Record successful completion of `offset`.
    pub fn complete(&mut self, topic: &str, partition: i32, offset: i64) {
        if let Some(done) = self.progress(topic, partition).pending.get_mut(&offset) {
            *done = true;
        }
    }

    /// Record a handler failure at `offset`; the partition stalls there.
    pub fn fail(&mut self, topic: &str, partition: i32, offset: i64) {
        let progress = self.progress(topic, partition);
        progress.pending.insert(offset, false);
        progress.halted = true;
    }

    /// Whether a handler failure stopped this partition.
    pub fn is_halted(&self, topic: &str, partition: i32) -> bool {
        self.partitions
            .get(&TopicPartition {
                topic: topic.to_owned(),
                partition,
            })
            .is_some_and(|p| p.halted)
    }

    /// Pop every partition whose contiguous done prefix advanced and
    /// return the next-to-read offset to commit for it.
    pub fn drain_committable(&mut self) -> Vec<(String, i32, i64)> {
        let mut out = Vec::new();
        for (key, progress) in &mut self.partitions {
            let mut next = None;
            while let Some((&offset, &done)) = progress.pending.first_key_value() {
                if !done {
                    break;
                }
                progress.pending.remove(&offset);
                next = Some(offset + 1);
            }
            if let Some(next) = next {
                out.push((key.topic.clone(), key.partition, next));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_only_the_contiguous_prefix() {
        let mut tracker = OffsetTracker::new();
        for offset in 0..4 {
            tracker.track("t", 0, offset);
        }

        tracker.complete("t", 0, 1);
        tracker.complete("t", 0, 3);
        assert!(tracker.drain_committable().is_empty());

        tracker.complete("t", 0, 0);
        assert_eq!(tracker.drain_committable(), vec![("t".to_owned(), 0, 2)]);

        tracker.complete("t", 0, 2);
        assert_eq!(tracker.drain_committable(), vec![("t".to_owned(), 0, 4)]);
        assert!(tracker.drain_committable().is_empty());
    }

    #[test]
    fn failure_freezes_the_partition() {
        let mut tracker = OffsetTracker::new();
        for offset in 0..3 {
            tracker.track("t", 0, offset);
        }

        tracker.complete("t", 0, 0);
        tracker.fail("t", 0, 1);
        tracker.complete("t", 0, 2);

        assert!(tracker.is_halted("t", 0));
        // offset 0 is still committable, nothing at or past the failure is
        assert_eq!(tracker.drain_committable(), vec![("t".to_owned(), 0, 1)]);
        assert!(tracker.drain_committable().is_empty());
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.track("t", 0, 0);
        tracker.track("t", 1, 0);
        tracker.track("u", 0, 0);

        tracker.fail("t", 0, 0);
        tracker.complete("t", 1, 0);
        tracker.complete("u", 0, 0);

        assert!(tracker.is_halted("t", 0));
        assert!(!tracker.is_halted("t", 1));

        let mut committable = tracker.drain_committable();
        committable.sort();
        assert_eq!(
            committable,
            vec![("t".to_owned(), 1, 1), ("u".to_owned(), 0, 1)]
        );
    }
}
