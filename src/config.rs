use std::time::Duration;

/// Tuning knobs for an [`Rcu`](crate::Rcu) instance.
///
/// The defaults are fine for payloads that change a few times a second.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the pending-update ring.
    ///
    /// One slot is always kept free so the empty and full states stay
    /// distinguishable: producers see the queue as full once
    /// `max_pending_updates - 1` updates are waiting. Values below 2 are
    /// treated as 2.
    pub max_pending_updates: usize,

    /// Longest the reclaimer sleeps between scans when no update arrives.
    ///
    /// This bounds how stale a retired value can get before the next
    /// grace-period check, not how quickly updates are applied (submissions
    /// wake the reclaimer immediately).
    pub reclaim_interval: Duration,

    /// Initial capacity reserved in each retirement bag. Bags grow past
    /// this on demand.
    pub retired_per_epoch_hint: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_pending_updates: 64,
            reclaim_interval: Duration::from_millis(10),
            retired_per_epoch_hint: 32,
        }
    }
}

impl Config {
    pub(crate) fn queue_capacity(&self) -> usize {
        self.max_pending_updates.max(2)
    }
}
