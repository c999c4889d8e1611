//! Pinned read views.
//!
//! A snapshot is a published sequence number: reads taken through it see
//! exactly the writes committed at or below that sequence, regardless of
//! later puts, deletes, or compactions. The compactor consults the
//! oldest live snapshot to decide which overwritten versions are still
//! reachable and must be retained.
//!
//! Snapshots release themselves on drop; the list holds weak references
//! and prunes them lazily.

use std::sync::{Arc, Mutex, Weak};

use crate::dbformat::SequenceNumber;

/// A pinned sequence number fixing a read view. Cheap to clone; the
/// view stays pinned until every clone is dropped.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

pub(crate) struct SnapshotInner {
    sequence: SequenceNumber,
}

impl Snapshot {
    /// The sequence number this snapshot pins.
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.inner.sequence)
            .finish()
    }
}

/// Registry of live snapshots, newest at the back.
pub(crate) struct SnapshotList {
    snapshots: Mutex<Vec<Weak<SnapshotInner>>>,
}

impl SnapshotList {
    pub(crate) fn new() -> SnapshotList {
        SnapshotList {
            snapshots: Mutex::new(Vec::new()),
        }
    }

    /// Publish a snapshot at `sequence`.
    pub(crate) fn acquire(&self, sequence: SequenceNumber) -> Snapshot {
        let inner = Arc::new(SnapshotInner { sequence });
        let mut snapshots = self.snapshots.lock().unwrap();
        snapshots.retain(|w| w.strong_count() > 0);
        snapshots.push(Arc::downgrade(&inner));
        Snapshot { inner }
    }

    /// The smallest live pinned sequence, or `fallback` when no
    /// snapshot is live.
    pub(crate) fn oldest(&self, fallback: SequenceNumber) -> SequenceNumber {
        let mut snapshots = self.snapshots.lock().unwrap();
        snapshots.retain(|w| w.strong_count() > 0);
        snapshots
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|s| s.sequence)
            .min()
            .unwrap_or(fallback)
    }

    /// Whether any snapshot is currently live.
    pub(crate) fn is_empty(&self) -> bool {
        let mut snapshots = self.snapshots.lock().unwrap();
        snapshots.retain(|w| w.strong_count() > 0);
        snapshots.is_empty()
    }
}
