//! Channels, jobs and the host unit of the gfxhost submission engine.
//!
//! A [`Host`] owns the syncpoint registry, the completion-action queue, the buffer manager and
//! a set of [`Channel`]s. Clients describe work as a [`Job`] (gathers from command buffers plus
//! the syncpoint increments the work performs) and submit it to a channel; the channel writes
//! host waits and gather op-codes into its command ring and returns one [`Fence`] per
//! incremented syncpoint.
//!
//! ```text
//! validate -> pin -> lock channel -> begin -> [serialize waits] -> [base loads]
//!          -> increment_max -> gathers -> end (kick) -> arm completions -> unlock
//! ```
//!
//! [`sim`] provides a software command processor so the whole path can run without hardware.
//!
//! [`Fence`]: gfxhost_syncpt::Fence

#![forbid(unsafe_code)]

mod channel;
pub mod config;
mod error;
mod host;
pub mod job;
pub mod mem;
pub mod sim;
mod stats;

pub use channel::{Channel, Interrupt, SubmitReceipt, SubmitWarning};
pub use config::{ChannelConfig, ConfigError, HostConfig};
pub use error::{HostError, JobError, Result, SubmitError};
pub use host::{Host, HostResources};
pub use job::{
    CompletionFn, Gather, Job, JobBuilder, JobDone, JobFlags, JobLimits, Reloc, SyncptIncr,
    WaitCheck,
};
pub use mem::{BufferHandle, BufferObject, MemError, MemoryManager, PinGuard};
pub use sim::{simulated_host, HwEvent, SimEngine, SimWorker, StepOutcome};
pub use stats::{ChannelStats, ChannelStatsSnapshot};

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
