//! Error types for coordinator operations.

use marathon_proto::{TaskId, TaskState};

/// Alias for `Result<T, marathon_coordinator::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by coordinator operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A transition was requested out of a terminal state.
    #[error("task {task} is already terminal ({state})")]
    TerminalState {
        /// The task in question.
        task: TaskId,
        /// Its terminal state.
        state: TaskState,
    },

    /// The referenced task does not exist.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// A peer sent a frame that violates the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A configuration value was missing or malformed.
    #[error("configuration: {0}")]
    Config(String),

    /// An I/O error from server or connection operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
