use gfxhost_cdma::CdmaError;
use gfxhost_syncpt::SyncptError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, SubmitError>;

/// Reasons a job is rejected before anything is locked or reserved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job increments no syncpoint")]
    NoIncrements,

    #[error("syncpoint {0} is reserved and cannot be used by jobs")]
    ReservedSyncpt(u32),

    #[error("syncpoint {0} does not exist")]
    UnknownSyncpt(u32),

    #[error("syncpoint {0} is incremented more than once in the same job")]
    DuplicateSyncpt(u32),

    #[error("syncpoint {id} increment count must be non-zero")]
    ZeroIncrement { id: u32 },

    #[error("wait base {base} does not exist (channel has {count})")]
    UnknownWaitBase { base: u32, count: u32 },

    #[error("gather {index} selects class {class:#x}, which this channel cannot use")]
    InvalidClass { index: usize, class: u32 },

    #[error("job has {count} gathers and relocations, limit is {max}")]
    TooManyGathers { count: usize, max: usize },

    #[error("job has {count} wait checks, limit is {max}")]
    TooManyWaitChecks { count: usize, max: usize },

    #[error("gather {index} is empty")]
    EmptyGather { index: usize },

    #[error("gather {index} has {words} words, a gather holds at most {max}")]
    GatherTooLarge { index: usize, words: u32, max: u32 },

    #[error("gather {index} is out of its buffer's bounds")]
    GatherOutOfRange { index: usize },

    #[error("relocation {index} is out of bounds or misaligned")]
    RelocOutOfRange { index: usize },

    #[error("wait check {index} is out of bounds or misaligned")]
    WaitCheckOutOfRange { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The caller's interrupt was raised while waiting for the channel lock.
    #[error("interrupted while waiting for the channel")]
    Interrupted,

    #[error("out of memory reserving completion actions for syncpoint {syncpt_id}")]
    OutOfMemory { syncpt_id: u32 },

    #[error("channel's command ring already has an open transaction")]
    Busy,

    #[error("job needs {words} ring words, ring holds {capacity}")]
    RingOverflow { words: u32, capacity: u32 },

    #[error("invalid job: {0}")]
    InvalidJob(#[from] JobError),

    #[error("channel {0} does not exist")]
    UnknownChannel(u32),

    #[error(transparent)]
    Syncpt(SyncptError),

    #[error(transparent)]
    Cdma(CdmaError),
}

impl From<CdmaError> for SubmitError {
    fn from(err: CdmaError) -> Self {
        match err {
            CdmaError::Busy => SubmitError::Busy,
            CdmaError::RingOverflow { words, capacity } => {
                SubmitError::RingOverflow { words, capacity }
            }
            other => SubmitError::Cdma(other),
        }
    }
}

impl From<SyncptError> for SubmitError {
    fn from(err: SyncptError) -> Self {
        match err {
            SyncptError::OutOfMemory { id } => SubmitError::OutOfMemory { syncpt_id: id },
            other => SubmitError::Syncpt(other),
        }
    }
}

/// Errors building a [`Host`](crate::Host).
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create command ring: {0}")]
    Cdma(#[from] CdmaError),
}
