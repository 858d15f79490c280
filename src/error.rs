use thiserror::Error;

/// Errors surfaced by [`Rcu::read`](crate::Rcu::read) and
/// [`Rcu::update`](crate::Rcu::update).
///
/// Both variants are recoverable: the instance is left unchanged and the
/// caller decides whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RcuError {
    /// The instance is not accepting operations, either because construction
    /// has not finished or because shutdown has begun.
    #[error("rcu instance is not active")]
    NotActive,

    /// The pending-update ring is at capacity; the update was not enqueued.
    #[error("modification queue is full")]
    QueueFull,
}

/// Error type produced by user update closures.
///
/// A failing closure is logged by the reclaimer and skipped; the published
/// snapshot is left unchanged and later queued updates still run.
pub type UpdateError = Box<dyn std::error::Error + Send + Sync + 'static>;
