//! Bounded MPSC ring carrying pending updates to the reclaimer.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crossbeam_utils::CachePadded;

use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::thread;

/// One ring slot plus its turn stamp.
///
/// The stamp cycles through `index`, `index + 1`, `index + capacity`,
/// `index + capacity + 1`, ...: equal to the tail means "free for the
/// producer claiming that tail", tail + 1 means "holds the value published
/// at that tail". The stamp is what lets several producers race for slots
/// without ever publishing a half-written one.
struct Slot<T> {
    seq: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity multi-producer ring with exactly one consumer.
///
/// Producers never block: a full ring is reported back to the caller with
/// the rejected value. One slot is always kept free so `head == tail` can
/// only mean empty.
pub(crate) struct UpdateQueue<T> {
    slots: Box<[Slot<T>]>,
    /// Next sequence number a producer will claim.
    tail: CachePadded<AtomicU64>,
    /// Next sequence number the consumer will take. Written only by the
    /// consumer.
    head: CachePadded<AtomicU64>,
}

// SAFETY: slot handoff is mediated by the stamp protocol; a value is moved
// in by exactly one producer and out by the single consumer.
unsafe impl<T: Send> Send for UpdateQueue<T> {}
unsafe impl<T: Send> Sync for UpdateQueue<T> {}

impl<T> UpdateQueue<T> {
    pub(crate) fn new(capacity: usize) -> UpdateQueue<T> {
        assert!(capacity >= 2, "ring needs its one-slot slack");
        let slots = (0..capacity as u64)
            .map(|i| Slot {
                seq: AtomicU64::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        UpdateQueue {
            slots,
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues `value`, or hands it back if the ring is full.
    ///
    /// Callable from any number of threads concurrently.
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        let cap = self.slots.len() as u64;
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= cap - 1 {
                // A stale `head` only over-reports occupancy, which errs on
                // the full side.
                return Err(value);
            }
            let slot = &self.slots[(tail % cap) as usize];
            if slot.seq.load(Ordering::Acquire) != tail {
                // Another producer claimed this slot but has not published
                // yet, or our tail is stale.
                tail = self.tail.load(Ordering::Relaxed);
                thread::yield_now();
                continue;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // SAFETY: the CAS made us the unique owner of this slot
                    // until the stamp store below publishes it.
                    unsafe { (*slot.value.get()).write(value) };
                    slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
                Err(current) => tail = current,
            }
        }
    }

    /// Takes the oldest queued value, if any.
    ///
    /// # Safety
    ///
    /// There must be at most one popping thread at any time. The reclaimer
    /// is the sole consumer while the instance runs; `Drop` pops through
    /// `&mut self`.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let cap = self.slots.len() as u64;
        // Relaxed: the consumer is the only writer of `head`.
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[(head % cap) as usize];
        if slot.seq.load(Ordering::Acquire) != head.wrapping_add(1) {
            // Empty, or a producer claimed the slot but has not published.
            return None;
        }
        // SAFETY: the stamp says the producer finished writing, and the
        // caller guarantees no other consumer raced us here.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        // Free the slot for the producer one lap ahead.
        slot.seq.store(head.wrapping_add(cap), Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// How many values are waiting. Racy by nature; informational.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }
}

impl<T> Drop for UpdateQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` makes this the only accessor.
        while unsafe { self.pop() }.is_some() {}
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::sync::Arc;

    #[test]
    fn racing_producers_never_lose_or_duplicate() {
        loom::model(|| {
            let q = Arc::new(UpdateQueue::new(4));

            let producers: Vec<_> = [1u32, 2]
                .into_iter()
                .map(|v| {
                    let q = Arc::clone(&q);
                    thread::spawn(move || q.push(v).unwrap())
                })
                .collect();
            for p in producers {
                p.join().unwrap();
            }

            // SAFETY: producers joined; this is the only popper.
            let mut drained = vec![
                unsafe { q.pop() }.unwrap(),
                unsafe { q.pop() }.unwrap(),
            ];
            drained.sort_unstable();
            assert_eq!(drained, [1, 2]);
            assert!(unsafe { q.pop() }.is_none());
        });
    }

    #[test]
    fn producer_and_consumer_interleave() {
        loom::model(|| {
            let q = Arc::new(UpdateQueue::new(2));

            let producer = {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for v in [10u32, 20] {
                        let mut v = v;
                        loop {
                            match q.push(v) {
                                Ok(()) => break,
                                Err(back) => {
                                    v = back;
                                    thread::yield_now();
                                }
                            }
                        }
                    }
                })
            };

            let mut seen = Vec::new();
            while seen.len() < 2 {
                // SAFETY: sole consumer in this model.
                match unsafe { q.pop() } {
                    Some(v) => seen.push(v),
                    None => thread::yield_now(),
                }
            }
            assert_eq!(seen, [10, 20]);

            producer.join().unwrap();
        });
    }
}
