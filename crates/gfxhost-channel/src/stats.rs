use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::SubmitError;

/// Per-channel submission counters.
///
/// Updated from submitting threads and from the completion path without locking.
#[derive(Debug, Default)]
pub struct ChannelStats {
    submits: AtomicU64,
    interrupted: AtomicU64,
    out_of_memory: AtomicU64,
    busy: AtomicU64,
    ring_overflows: AtomicU64,
    invalid_jobs: AtomicU64,
    other_failures: AtomicU64,
    words_pushed: AtomicU64,
    gathers: AtomicU64,
    completions: AtomicU64,
    arm_failures: AtomicU64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submit(&self, words: u32, gathers: usize) {
        self.submits.fetch_add(1, Ordering::Relaxed);
        self.words_pushed
            .fetch_add(u64::from(words), Ordering::Relaxed);
        self.gathers.fetch_add(gathers as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, err: &SubmitError) {
        let counter = match err {
            SubmitError::Interrupted => &self.interrupted,
            SubmitError::OutOfMemory { .. } => &self.out_of_memory,
            SubmitError::Busy => &self.busy,
            SubmitError::RingOverflow { .. } => &self.ring_overflows,
            SubmitError::InvalidJob(_) => &self.invalid_jobs,
            _ => &self.other_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_arm_failure(&self) {
        self.arm_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            submits: self.submits.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            out_of_memory: self.out_of_memory.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            ring_overflows: self.ring_overflows.load(Ordering::Relaxed),
            invalid_jobs: self.invalid_jobs.load(Ordering::Relaxed),
            other_failures: self.other_failures.load(Ordering::Relaxed),
            words_pushed: self.words_pushed.load(Ordering::Relaxed),
            gathers: self.gathers.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            arm_failures: self.arm_failures.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatsSnapshot {
    pub submits: u64,
    pub interrupted: u64,
    pub out_of_memory: u64,
    pub busy: u64,
    pub ring_overflows: u64,
    pub invalid_jobs: u64,
    pub other_failures: u64,
    pub words_pushed: u64,
    pub gathers: u64,
    pub completions: u64,
    pub arm_failures: u64,
}

impl ChannelStatsSnapshot {
    pub fn failures(&self) -> u64 {
        self.interrupted
            + self.out_of_memory
            + self.busy
            + self.ring_overflows
            + self.invalid_jobs
            + self.other_failures
    }

    /// Jobs submitted whose completion has not run yet.
    pub fn outstanding(&self) -> u64 {
        self.submits.saturating_sub(self.completions)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
