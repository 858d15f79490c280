//! Latest-value RCU: wait-free readers, asynchronous updates applied by a
//! background reclaimer, destruction of old snapshots deferred by epochs.
//!
//! One [`Rcu`] publishes a single immutable value of type `T`. Readers pin
//! themselves through a per-thread participant record and borrow the latest
//! published snapshot; writers enqueue closures that produce the next
//! snapshot from the current one. The reclaimer thread applies queued
//! closures in order, swaps each result into the shared cell, and frees a
//! displaced value only once a grace period guarantees no reader can still
//! hold it: a value retired at global epoch `E` waits in an epoch-indexed
//! bag until the epoch reaches `E + 2`.
//!
//! - Reading is wait-free after a thread's first read: one Acquire epoch
//!   load, two stores into the thread's own record, one Acquire pointer
//!   load. The first read on a thread registers it under a short-held lock.
//! - Updating never blocks. It either enqueues and wakes the reclaimer, or
//!   reports the ring full and leaves the caller to decide.
//! - There is no synchronous publish: after [`Rcu::update`] returns, the
//!   update is pending until the reclaimer applies it.
//!
//! ```
//! let rcu = epoch_rcu::Rcu::new(8080u16);
//!
//! rcu.update(|port| Ok(port + 1)).unwrap();
//!
//! let guard = rcu.read().unwrap();
//! assert!(*guard == 8080 || *guard == 8081);
//! ```

mod bags;
mod config;
mod diagnostics;
mod error;
mod inner;
mod queue;
mod registry;
mod sync;

pub use crate::config::Config;
pub use crate::diagnostics::Diagnostics;
pub use crate::error::{RcuError, UpdateError};

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ops::Deref;

use crate::inner::{Inner, PendingUpdate};
use crate::registry::Participant;
use crate::sync::atomic::{self, Ordering};
use crate::sync::{thread, thread_local, Arc};

/// Distinguishes instances in the per-thread participant cache. Plain std
/// atomic even under loom: ids only need uniqueness.
static NEXT_INSTANCE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

thread_local! {
    /// This thread's participant records, keyed by instance id.
    ///
    /// Raw pointers are fine here: a record lives exactly as long as its
    /// instance's shared state, ids are never reused, and the pointer is
    /// only dereferenced while a borrow of the owning [`Rcu`] proves the
    /// instance alive.
    static PARTICIPANTS: RefCell<Vec<(u64, *const Participant)>> = RefCell::new(Vec::new());
}

/// Shared, mutable-by-replacement container with wait-free readers.
///
/// Owns the background reclaimer thread. Dropping the handle (or calling
/// [`deinit`](Rcu::deinit)) drains pending updates, frees every retired
/// snapshot, and blocks until the reclaimer joins. All read guards must be
/// released before that point; holding one across shutdown is a caller bug
/// this type does not defend against.
pub struct Rcu<T> {
    inner: Arc<Inner<T>>,
    reclaimer: Option<thread::JoinHandle<()>>,
    id: u64,
    // pointer so the auto impls stay off; the real bounds are below.
    _marker: PhantomData<*const T>,
}

// SAFETY: sharing an `Rcu` hands out borrows of `T` on arbitrary threads
// and moves owned `T`s between the callers and the reclaimer, so both
// bounds are required; with them, every cross-thread handoff inside is
// mediated by the cell swap, the ring stamps, or the registry atomics.
unsafe impl<T: Send + Sync> Send for Rcu<T> {}
unsafe impl<T: Send + Sync> Sync for Rcu<T> {}

impl<T: Send + Sync + 'static> Rcu<T> {
    /// Builds an instance with [`Config::default`] and publishes `initial`.
    pub fn new(initial: T) -> Rcu<T> {
        Rcu::with_config(initial, Config::default())
    }

    /// Builds an instance, publishes `initial`, spawns the reclaimer, and
    /// activates the handle.
    pub fn with_config(initial: T, config: Config) -> Rcu<T> {
        let inner = Arc::new(Inner::new(initial, config));
        let reclaimer = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || inner.run())
        };
        inner.lifecycle.activate();
        Rcu {
            inner,
            reclaimer: Some(reclaimer),
            id: NEXT_INSTANCE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// Enqueues `f` to produce the next snapshot from the current one.
    ///
    /// Returns as soon as the closure is queued. Closures run serially on
    /// the reclaimer thread, in submission order, each seeing the value
    /// published by its predecessor; they should not block for long. A
    /// closure that returns `Err` is logged and skipped, leaving the
    /// published snapshot untouched.
    pub fn update<F>(&self, f: F) -> Result<(), RcuError>
    where
        F: FnOnce(&T) -> Result<T, UpdateError> + Send + 'static,
    {
        if !self.inner.lifecycle.is_active() {
            return Err(RcuError::NotActive);
        }
        let pending: PendingUpdate<T> = Box::new(f);
        if self.inner.queue.push(pending).is_err() {
            return Err(RcuError::QueueFull);
        }
        self.inner.counters.count_update();
        self.inner.wake.notify();
        Ok(())
    }
}

impl<T> Rcu<T> {
    /// Opens a read critical section on the latest published snapshot.
    ///
    /// Wait-free except for the very first call on each thread, which
    /// registers the thread under a short-held lock. Reads nest freely on
    /// one thread. Fails with [`RcuError::NotActive`] once shutdown begins.
    pub fn read(&self) -> Result<ReadGuard<'_, T>, RcuError> {
        if !self.inner.lifecycle.is_active() {
            return Err(RcuError::NotActive);
        }
        let participant = self.participant();
        participant.enter(self.inner.current_epoch());
        // The advertisement above must be visible to the grace-period scan
        // before any snapshot load below it; pairs with the fence in
        // `Inner::try_advance`.
        atomic::fence(Ordering::SeqCst);
        self.inner.counters.count_read();
        Ok(ReadGuard {
            inner: &self.inner,
            participant,
            _marker: PhantomData,
        })
    }

    /// The calling thread's participant record, created on first use.
    fn participant(&self) -> &Participant {
        let cached = PARTICIPANTS.with(|slots| {
            slots
                .borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .map(|&(_, p)| p)
        });
        let ptr = match cached {
            Some(p) => p,
            None => {
                let record = self.inner.registry.register();
                let p: *const Participant = &*record;
                PARTICIPANTS.with(|slots| slots.borrow_mut().push((self.id, p)));
                p
            }
        };
        // SAFETY: the record lives as long as `self.inner` (the registry
        // never removes entries) and ids are never reused, so a cache hit
        // is ours and still valid.
        unsafe { &*ptr }
    }

    /// Stops accepting reads and updates, lets the reclaimer drain the
    /// queue and free every retired value, and joins it.
    ///
    /// Idempotent; `Drop` calls it too. Release all read guards first.
    pub fn deinit(&mut self) {
        if !self.inner.lifecycle.begin_shutdown() {
            return;
        }
        self.inner.wake.notify();
        if let Some(handle) = self.reclaimer.take() {
            if handle.join().is_err() {
                log::error!("reclaimer thread panicked during shutdown");
            }
        }
        self.inner.lifecycle.terminate();
    }

    /// Currently effective configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Snapshot of the monotonic event counters.
    #[cfg(debug_assertions)]
    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.counters.snapshot()
    }
}

impl<T> Drop for Rcu<T> {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// Scoped read critical section handed out by [`Rcu::read`].
///
/// Holds the calling thread's participant pinned; dropping the guard
/// releases the pin. The guard cannot leave its thread: the pin bookkeeping
/// belongs to the thread that took it.
pub struct ReadGuard<'a, T> {
    inner: &'a Inner<T>,
    participant: &'a Participant,
    // pointer used so we get !Send/!Sync without `unsafe impl`s.
    _marker: PhantomData<*const T>,
}

impl<'a, T> ReadGuard<'a, T> {
    /// Borrows the latest published snapshot.
    ///
    /// Two calls on the same guard may observe different snapshots if the
    /// reclaimer published in between; every borrow stays valid until the
    /// guard drops.
    pub fn get(&self) -> &T {
        // SAFETY: this thread's participant stays active for as long as
        // the guard lives, so nothing the cell has pointed to since the
        // pin can have been freed.
        unsafe { self.inner.snapshot() }
    }
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.participant.exit();
    }
}
