use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncptError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncptError {
    #[error("syncpoint {0} does not exist")]
    NotFound(u32),

    /// Syncpoint 0 is reserved as the always-expired syncpoint used for patched waits.
    #[error("syncpoint {0} is reserved")]
    Reserved(u32),

    #[error("no free syncpoints left to assign")]
    Exhausted,

    /// Allocating a completion-action record failed.
    #[error("out of memory allocating completion action for syncpoint {id}")]
    OutOfMemory { id: u32 },
}
