use thiserror::Error;

pub type Result<T> = std::result::Result<T, CdmaError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CdmaError {
    /// Another transaction is still open on this ring.
    #[error("command ring already has an open transaction")]
    Busy,

    #[error("transaction of {words} words does not fit in a ring of {capacity} words")]
    RingOverflow { words: u32, capacity: u32 },

    #[error("pushed past the {reserved} words reserved for this transaction")]
    Overrun { reserved: u32 },

    #[error("timed out waiting for the command ring to drain")]
    Timeout,

    #[error("ring capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(u32),
}
