//! Syncpoint registry and completion-action queue for the gfxhost submission engine.
//!
//! A syncpoint is a free-running 32-bit counter that hardware increments as it retires work.
//! Software tracks two values per counter:
//!
//! - `current` (a.k.a. `min`): the last value observed from hardware (or a CPU increment),
//! - `max`: the value the counter will reach once every submitted job has finished.
//!
//! This crate provides:
//!
//! - [`SyncptRegistry`] / [`Syncpt`]: the counters themselves, including the atomic
//!   [`Syncpt::increment_max`] reservation primitive the submission engine relies on,
//! - [`Intr`]: per-syncpoint lists of [completion actions](Intr::arm) that fire once a
//!   threshold has been reached,
//! - [`Intr::wait`]: a blocking, timeout-bounded wait built on top of the action queue,
//! - [`threshold`]: the wrap-aware comparison rules shared by all of the above.
#![forbid(unsafe_code)]

mod error;
pub mod intr;
pub mod registry;
pub mod threshold;
mod wait;

pub use error::{Result, SyncptError};
pub use intr::{ActionFired, ActionFn, ActionToken, Intr};
pub use registry::{Syncpt, SyncptRegistry, SYNCPT_RESERVED};
pub use wait::{WaitOutcome, WAIT_CHECK_PERIOD};

/// A (syncpoint, threshold) pair: "done once syncpoint `id` reaches `thresh`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence {
    pub id: u32,
    pub thresh: u32,
}

impl Fence {
    pub fn new(id: u32, thresh: u32) -> Self {
        Self { id, thresh }
    }

    /// Returns whether this fence has been reached according to `registry`.
    ///
    /// Unknown syncpoints are reported as an error rather than treated as expired.
    pub fn is_expired(&self, registry: &SyncptRegistry) -> Result<bool> {
        Ok(registry.get(self.id)?.is_expired(self.thresh))
    }
}

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
