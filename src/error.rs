use crate::ids::ServerId;
use crate::options::ConfigError;
use crate::state_machine::StateMachineError;
use std::io;

/// Errors delivered to client waiters and facade callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    // The submitted entry's log slot was overwritten by an entry from a later
    // term. It will never commit in the term it was submitted with.
    #[error("the entry was dropped because its slot was taken by a later term")]
    DroppedEntry,

    // The server lost track of the entry: it was deposed with entries still
    // uncommitted, or a snapshot subsumed the relevant log suffix.
    #[error("commit status of the entry is unknown")]
    CommitStatusUnknown,

    #[error("not a leader, current leader is {0:?}")]
    NotALeader(Option<ServerId>),

    #[error("the server is shutting down")]
    Stopped,

    #[error("leadership transfer did not complete in time")]
    Timeout,

    #[error("an equivalent operation is already in progress")]
    AlreadyInProgress,
}

/// Errors from `Server::start`.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load persisted state")]
    Storage(#[from] io::Error),

    #[error("failed to restore the user state machine")]
    StateMachine(#[from] StateMachineError),
}
