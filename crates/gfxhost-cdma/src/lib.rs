//! Per-channel command ring ("CDMA") for the gfxhost submission engine.
//!
//! A [`Cdma`] is a fixed-size circular buffer of 32-bit command words. Submitters frame their
//! work as transactions:
//!
//! ```text
//! Idle --begin(words)--> Open --push*--> Open --end(fences)--> Idle (kick)
//!                          \--drop------------------------------> Idle (rollback)
//! ```
//!
//! Committed transactions are tracked in a sync queue and their words are reclaimed once the
//! syncpoint fences recorded with them expire, which is what gives submitters backpressure
//! when the ring is full.
//!
//! [`opcodes`] holds the command-word encodings and [`HostOps`] the per-generation host
//! operations built from them.
#![forbid(unsafe_code)]

mod cdma;
mod error;
pub mod hw;
pub mod opcodes;
pub mod ops;
pub mod ring;

pub use cdma::{Cdma, CdmaSnapshot, CdmaTxn};
pub use error::{CdmaError, Result};
pub use hw::{CdmaHw, NullCdmaHw, RecordingCdmaHw};
pub use ops::{Host1xV1, Host1xV2, HostGeneration, HostOps, OpWords};
pub use ring::RingMemory;

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
