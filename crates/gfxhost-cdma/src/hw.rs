use std::sync::{Arc, Mutex};

use crate::ring::RingMemory;

/// A channel's hardware register window, as seen by the command ring.
///
/// The only operation the ring needs is publishing a new write pointer. Implementations may
/// start consuming immediately or on their own schedule, but must not call back into the
/// [`Cdma`](crate::Cdma) that kicked them from inside `kick`: the ring's state lock is held
/// across the call so successive kicks are observed in order.
pub trait CdmaHw: Send + Sync {
    /// Makes every word before `put` visible to the consumer.
    fn kick(&self, ring: &Arc<RingMemory>, put: u32);
}

/// Register window that never consumes anything.
///
/// Jobs submitted through it only complete through CPU increments.
#[derive(Debug, Default)]
pub struct NullCdmaHw;

impl NullCdmaHw {
    pub fn new() -> Self {
        Self
    }
}

impl CdmaHw for NullCdmaHw {
    fn kick(&self, _ring: &Arc<RingMemory>, _put: u32) {}
}

/// Register window that records every kick, for tests and debug dumps.
#[derive(Debug, Default)]
pub struct RecordingCdmaHw {
    kicks: Mutex<Vec<u32>>,
}

impl RecordingCdmaHw {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write pointers published so far, oldest first.
    pub fn kicks(&self) -> Vec<u32> {
        crate::lock(&self.kicks).clone()
    }

    pub fn last_put(&self) -> Option<u32> {
        crate::lock(&self.kicks).last().copied()
    }
}

impl CdmaHw for RecordingCdmaHw {
    fn kick(&self, _ring: &Arc<RingMemory>, put: u32) {
        crate::lock(&self.kicks).push(put);
    }
}
