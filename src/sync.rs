//! Imports that switch between `std` and `loom` synchronization primitives.
//!
//! Everything that participates in a concurrency model must come through
//! here so that building with `--cfg loom` swaps the whole crate at once.

#[cfg(loom)]
pub(crate) use loom::{
    sync::{atomic, Arc, Condvar, Mutex},
    thread, thread_local,
};
#[cfg(not(loom))]
pub(crate) use std::{
    sync::{atomic, Arc, Condvar, Mutex},
    thread, thread_local,
};
