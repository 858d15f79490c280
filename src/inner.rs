//! Shared instance state and the reclaimer that owns it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::bags::RetireBags;
use crate::config::Config;
use crate::diagnostics::Counters;
use crate::error::UpdateError;
use crate::queue::UpdateQueue;
use crate::registry::{Participant, Registry};
use crate::sync::atomic::{self, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use crate::sync::{Arc, Condvar, Mutex};

/// A queued update: takes the current snapshot, returns its successor.
pub(crate) type PendingUpdate<T> = Box<dyn FnOnce(&T) -> Result<T, UpdateError> + Send>;

const INITIALIZING: u8 = 0;
const ACTIVE: u8 = 1;
const SHUTTING_DOWN: u8 = 2;
const TERMINATED: u8 = 3;

/// Instance state machine:
/// `Initializing -> Active -> ShuttingDown -> Terminated`.
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Lifecycle {
        Lifecycle(AtomicU8::new(INITIALIZING))
    }

    /// True once construction finished and shutdown has not begun. Reads
    /// and updates refuse in every other state.
    pub(crate) fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire) == ACTIVE
    }

    /// True while the reclaimer should keep cycling. The reclaimer is
    /// spawned before the constructor flips to Active, so Initializing
    /// counts as running.
    fn keeps_running(&self) -> bool {
        self.0.load(Ordering::Acquire) <= ACTIVE
    }

    pub(crate) fn activate(&self) {
        self.0.store(ACTIVE, Ordering::Release);
    }

    /// First caller wins and drives the shutdown; everyone else observes a
    /// non-active state and backs off.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.0
            .compare_exchange(ACTIVE, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn terminate(&self) {
        self.0.store(TERMINATED, Ordering::Release);
    }
}

/// Wakes the reclaimer out of its timed wait.
///
/// A plain flag under a mutex plus a condvar: a notification that lands
/// while the reclaimer is mid-cycle is remembered by the flag and consumed
/// by the next wait, so wakeups are never lost.
pub(crate) struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    fn new() -> WakeSignal {
        WakeSignal {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        *self.pending.lock().unwrap() = true;
        self.cond.notify_one();
    }

    /// Blocks until notified or `timeout` elapses, then consumes the
    /// pending flag. A spurious wake just means an extra scan.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock().unwrap();
        #[cfg(not(loom))]
        {
            if !*pending {
                let (guard, _) = self.cond.wait_timeout(pending, timeout).unwrap();
                pending = guard;
            }
        }
        #[cfg(loom)]
        {
            // loom has no notion of time; the periodic-scan timeout is a
            // heuristic anyway, so modelling it as a plain wait is fine.
            let _ = timeout;
            if !*pending {
                pending = self.cond.wait(pending).unwrap();
            }
        }
        *pending = false;
    }
}

/// State shared between the public handle, every reader, and the reclaimer.
pub(crate) struct Inner<T> {
    /// Currently published snapshot. Really a `Box<T>`; kept raw so readers
    /// can take it with a single Acquire load.
    cell: AtomicPtr<T>,

    /// Global reclamation era. 64 bits do not wrap in a realistic lifetime.
    epoch: AtomicU64,

    pub(crate) lifecycle: Lifecycle,
    pub(crate) registry: Registry,
    pub(crate) queue: UpdateQueue<PendingUpdate<T>>,
    bags: RetireBags<T>,
    pub(crate) wake: WakeSignal,
    pub(crate) counters: Counters,
    pub(crate) config: Config,
}

impl<T> Inner<T> {
    pub(crate) fn new(initial: T, config: Config) -> Inner<T> {
        Inner {
            cell: AtomicPtr::new(Box::into_raw(Box::new(initial))),
            epoch: AtomicU64::new(0),
            lifecycle: Lifecycle::new(),
            registry: Registry::new(),
            queue: UpdateQueue::new(config.queue_capacity()),
            bags: RetireBags::new(config.retired_per_epoch_hint),
            wake: WakeSignal::new(),
            counters: Counters::new(),
            config,
        }
    }

    /// Epoch a reader is about to advertise.
    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Loads the published snapshot.
    ///
    /// # Safety
    ///
    /// The caller must keep an active participant pinned for as long as the
    /// returned borrow is used; see `Rcu::read`.
    pub(crate) unsafe fn snapshot(&self) -> &T {
        // Pairs with the AcqRel swap in `apply_pending`.
        unsafe { &*self.cell.load(Ordering::Acquire) }
    }

    /// Applies every queued update in submission order, publishing each
    /// result and retiring the value it displaced.
    ///
    /// Only the reclaimer thread calls this: it is the queue's sole
    /// consumer and the only writer of the cell.
    pub(crate) fn apply_pending(&self) {
        // SAFETY: single consumer, see above.
        while let Some(update) = unsafe { self.queue.pop() } {
            // Relaxed: nobody else ever swaps the cell, so this thread's
            // own last store is the latest. Later updates in this drain see
            // the values published by earlier ones.
            let current = unsafe { &*self.cell.load(Ordering::Relaxed) };
            match catch_unwind(AssertUnwindSafe(|| update(current))) {
                Ok(Ok(next)) => {
                    let next = Box::into_raw(Box::new(next));
                    // Publishes the new snapshot; pairs with the Acquire
                    // loads on the reader side.
                    let prev = self.cell.swap(next, Ordering::AcqRel);
                    let retire_epoch = self.epoch.load(Ordering::Acquire);
                    // SAFETY: `prev` was just unpublished; exactly one
                    // owner exists for any displaced snapshot and it is us.
                    let displaced = unsafe { Box::from_raw(prev) };
                    if !self.bags.retire(displaced, retire_epoch) {
                        self.counters.count_reclamations(1);
                    }
                }
                Ok(Err(err)) => {
                    log::warn!("update function failed, keeping current snapshot: {err}");
                }
                Err(_) => {
                    log::error!("update function panicked, keeping current snapshot");
                }
            }
        }
    }

    /// One grace-period check: advance the global epoch if no active reader
    /// still sits behind it, then destroy whatever aged out.
    ///
    /// Returns whether the epoch advanced.
    pub(crate) fn try_advance(&self, scratch: &mut Vec<Arc<Participant>>) -> bool {
        // Order the reader-side `active` stores against the scan below;
        // the matching fence sits in `Rcu::read` between advertising and
        // the first snapshot load.
        atomic::fence(Ordering::SeqCst);

        let epoch = self.epoch.load(Ordering::Acquire);
        self.registry.snapshot(scratch);
        if scratch.iter().any(|p| p.holds_back(epoch)) {
            return false;
        }

        // Only this thread advances the epoch; the CAS keeps the scan and
        // the bump tied to the same value all the same.
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.counters.count_epoch_advance();

        let new_epoch = epoch + 1;
        if new_epoch >= 2 {
            let reclaimed = self.bags.drain_expired(new_epoch);
            self.counters.count_reclamations(reclaimed as u64);
            if reclaimed > 0 {
                log::trace!("epoch {new_epoch}: destroyed {reclaimed} retired value(s)");
            }
        }
        true
    }

    /// Reclaimer thread body: apply, scan, sleep, repeat, then one final
    /// drain once shutdown begins.
    pub(crate) fn run(&self) {
        let mut scratch = Vec::new();
        while self.lifecycle.keeps_running() {
            self.apply_pending();
            self.try_advance(&mut scratch);
            self.wake.wait(self.config.reclaim_interval);
        }

        // Nothing new is queued once the state left Active, so one apply
        // clears the queue. Three advances then age every remaining
        // retiree past its two-epoch window; the caller guarantees no
        // guard is live across deinit.
        self.apply_pending();
        for _ in 0..3 {
            self.try_advance(&mut scratch);
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // SAFETY: the last owner is going away: the reclaimer has joined
        // and no guard exists, so nothing can reach the published pointer.
        drop(unsafe { Box::from_raw(self.cell.load(Ordering::Relaxed)) });
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn push(inner: &Inner<u32>, update: impl FnOnce(&u32) -> Result<u32, UpdateError> + Send + 'static) {
        inner.queue.push(Box::new(update)).ok().unwrap();
    }

    #[test]
    fn updates_in_one_drain_stack() {
        let inner = Inner::new(1u32, Config::default());
        push(&inner, |v| Ok(v + 1));
        push(&inner, |v| Ok(v * 10));
        inner.apply_pending();
        assert_eq!(unsafe { *inner.snapshot() }, 20);
    }

    #[test]
    fn failed_update_is_skipped() {
        let inner = Inner::new(1u32, Config::default());
        push(&inner, |_| Err("nope".into()));
        push(&inner, |v| Ok(v + 1));
        inner.apply_pending();
        assert_eq!(unsafe { *inner.snapshot() }, 2);
    }

    #[test]
    fn pinned_reader_stalls_the_epoch() {
        let inner = Inner::new(0u32, Config::default());
        let mut scratch = Vec::new();

        let participant = inner.registry.register();
        participant.enter(inner.current_epoch());

        // The reader is at epoch 0, so exactly one advance is possible.
        assert!(inner.try_advance(&mut scratch));
        assert!(!inner.try_advance(&mut scratch));
        assert_eq!(inner.current_epoch(), 1);

        participant.exit();
        assert!(inner.try_advance(&mut scratch));
        assert_eq!(inner.current_epoch(), 2);
    }

    #[test]
    fn displaced_value_survives_two_epochs() {
        let tracked = StdArc::new(0u32);
        let inner = Inner::new(tracked.clone(), Config::default());
        let mut scratch = Vec::new();

        let next = StdArc::new(1u32);
        inner
            .queue
            .push(Box::new(move |_: &StdArc<u32>| Ok(next)))
            .ok()
            .unwrap();
        inner.apply_pending();

        // Retired at epoch 0; epochs 1 and 2 must pass before it drops.
        assert_eq!(StdArc::strong_count(&tracked), 2);
        assert!(inner.try_advance(&mut scratch));
        assert_eq!(StdArc::strong_count(&tracked), 2);
        assert!(inner.try_advance(&mut scratch));
        assert_eq!(StdArc::strong_count(&tracked), 1);
    }
}
