//! Per-thread reader records and the registry the reclaimer scans.

use std::cell::Cell;
use std::fmt;

use crate::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::sync::{Arc, Mutex};

/// Bookkeeping for one thread that reads through an [`Rcu`](crate::Rcu).
///
/// A record is created lazily on a thread's first read and lives until the
/// instance's shared state drops; nothing is recycled mid-run. A thread that
/// exits leaves a permanently inactive record behind, which the scan
/// tolerates.
pub(crate) struct Participant {
    /// True while the owning thread holds at least one read guard.
    active: AtomicBool,

    /// Global epoch observed when the outermost guard was taken.
    ///
    /// Stored `Relaxed`: the `Release` store of `active` that follows
    /// publishes it, and the scan only looks at it after its `Acquire` load
    /// of `active` returned true.
    local_epoch: AtomicU64,

    /// Read-guard nesting depth. Only the owning thread touches this (read
    /// guards can't leave their thread), so no synchronization is needed.
    nesting: Cell<u32>,

    /// Thread that owns this record.
    thread: std::thread::ThreadId,
}

// SAFETY: everything the reclaimer looks at is atomic; `nesting` is only
// ever accessed by the thread the record belongs to.
unsafe impl Send for Participant {}
unsafe impl Sync for Participant {}

impl Participant {
    fn new() -> Participant {
        Participant {
            active: AtomicBool::new(false),
            local_epoch: AtomicU64::new(0),
            nesting: Cell::new(0),
            thread: std::thread::current().id(),
        }
    }

    /// Opens a read critical section at `global_epoch`.
    ///
    /// Nested calls just bump the depth; the outermost call owns the
    /// published epoch.
    pub(crate) fn enter(&self, global_epoch: u64) {
        let depth = self.nesting.get();
        self.nesting.set(depth + 1);
        if depth > 0 {
            return;
        }
        self.local_epoch.store(global_epoch, Ordering::Relaxed);
        // Pairs with the Acquire load in `holds_back`; publishes
        // `local_epoch` along the way.
        self.active.store(true, Ordering::Release);
    }

    /// Closes the innermost read critical section opened by `enter`.
    pub(crate) fn exit(&self) {
        let depth = self.nesting.get();
        debug_assert!(depth > 0, "guard released more often than acquired");
        self.nesting.set(depth - 1);
        if depth == 1 {
            // After this store the scan may legally advance past us.
            self.active.store(false, Ordering::Release);
        }
    }

    /// Whether this record forbids advancing the global epoch away from
    /// `epoch`. Inactive records never do.
    pub(crate) fn holds_back(&self, epoch: u64) -> bool {
        self.active.load(Ordering::Acquire) && self.local_epoch.load(Ordering::Relaxed) < epoch
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("thread", &self.thread)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("local_epoch", &self.local_epoch.load(Ordering::Relaxed))
            .finish()
    }
}

/// All participant records of one instance.
///
/// Membership only ever grows. Insertions and membership snapshots are
/// serialised by a short-held lock; the epoch scan itself runs on the
/// snapshot, lock-free.
pub(crate) struct Registry {
    slots: Mutex<slab::Slab<Arc<Participant>>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            slots: Mutex::new(slab::Slab::new()),
        }
    }

    /// Registers the calling thread and returns its record.
    pub(crate) fn register(&self) -> Arc<Participant> {
        let participant = Arc::new(Participant::new());
        self.slots.lock().unwrap().insert(participant.clone());
        participant
    }

    /// Copies the current membership into `scratch`.
    ///
    /// A record inserted while the copy runs is picked up by the next
    /// snapshot; it starts inactive, so missing it here is safe.
    pub(crate) fn snapshot(&self, scratch: &mut Vec<Arc<Participant>>) {
        scratch.clear();
        let slots = self.slots.lock().unwrap();
        scratch.extend(slots.iter().map(|(_, p)| Arc::clone(p)));
    }
}
