//! Monotonic event counters.

use crate::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of an instance's counters, taken by
/// [`Rcu::diagnostics`](crate::Rcu::diagnostics).
///
/// All counters only ever grow. The copy is not atomic across fields;
/// counters incremented mid-snapshot may or may not be included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diagnostics {
    /// Read guards handed out.
    pub reads: u64,
    /// Updates accepted into the queue.
    pub updates: u64,
    /// Retired values destroyed, counting immediate-drop fallbacks.
    pub reclamations: u64,
    /// Successful global epoch advances.
    pub epoch_advances: u64,
}

pub(crate) struct Counters {
    reads: AtomicU64,
    updates: AtomicU64,
    reclamations: AtomicU64,
    epoch_advances: AtomicU64,
}

impl Counters {
    pub(crate) fn new() -> Counters {
        Counters {
            reads: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            reclamations: AtomicU64::new(0),
            epoch_advances: AtomicU64::new(0),
        }
    }

    pub(crate) fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_reclamations(&self, n: u64) {
        if n > 0 {
            self.reclamations.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn count_epoch_advance(&self) {
        self.epoch_advances.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            reads: self.reads.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            reclamations: self.reclamations.load(Ordering::Relaxed),
            epoch_advances: self.epoch_advances.load(Ordering::Relaxed),
        }
    }
}
