//! Point-in-time read views.
//!
//! A snapshot pins a sequence number: reads through it see exactly the
//! writes applied up to that sequence, and compaction keeps any entry
//! that some live snapshot might still read.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::memtable::SequenceNumber;

/// A pinned view of the database at one sequence number.
///
/// Obtained from `DB::snapshot`; pass it in `ReadOptions::snapshot`.
/// Dropping the last handle releases the pin.
pub struct Snapshot {
    sequence: SequenceNumber,
}

impl Snapshot {
    /// The pinned sequence number.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

/// Registry of live snapshots, oldest first.
pub(crate) struct SnapshotList {
    snapshots: Mutex<Vec<Arc<Snapshot>>>,
}

impl SnapshotList {
    pub(crate) fn new() -> Self {
        Self { snapshots: Mutex::new(Vec::new()) }
    }

    /// Registers a snapshot at `sequence`.
    pub(crate) fn acquire(&self, sequence: SequenceNumber) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot { sequence });
        let mut snapshots = self.snapshots.lock();
        debug_assert!(snapshots.last().map(|s| s.sequence <= sequence).unwrap_or(true));
        snapshots.push(Arc::clone(&snapshot));
        snapshot
    }

    /// The sequence compaction must preserve: the oldest live snapshot,
    /// or `fallback` (the current last sequence) when none exist.
    /// Dropped snapshots are pruned on the way.
    pub(crate) fn oldest_or(&self, fallback: SequenceNumber) -> SequenceNumber {
        let mut snapshots = self.snapshots.lock();
        snapshots.retain(|s| Arc::strong_count(s) > 1);
        snapshots.first().map(|s| s.sequence).unwrap_or(fallback)
    }
}
