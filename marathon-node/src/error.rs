//! Error types for node-daemon operations.

/// Alias for `Result<T, marathon_node::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by node-daemon operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No warm VM was available to satisfy an acquire.
    #[error("VM pool exhausted")]
    PoolExhausted,

    /// The requested snapshot is not registered.
    #[error("snapshot '{0}' not found")]
    SnapshotMissing(String),

    /// The hypervisor process could not be started or never became ready.
    #[error("hypervisor start failed: {0}")]
    HypervisorStart(String),

    /// A configuration value was missing or malformed.
    #[error("configuration: {0}")]
    Config(String),

    /// The peer sent a frame that violates the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An I/O error from pool, session, or transport operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
