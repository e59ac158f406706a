//! Error types for session orchestration
//!
//! Only synchronous precondition failures are returned to callers of the
//! public API. Failures observed by the monitor tasks (authentication
//! rejection, unexpected process exit, unreachable management channel) are
//! converted to state transitions and log-feed warnings instead of being
//! propagated across task boundaries.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the session orchestration API
#[derive(Debug, Error)]
pub enum Error {
    /// A session is already live; only one may exist at a time
    #[error("a VPN session is already active")]
    AlreadyConnected,

    /// No usable credentials were supplied
    #[error("no credentials configured")]
    MissingCredentials,

    /// The selected configuration file does not exist
    #[error("configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// The OpenVPN binary or the elevation helper could not be found
    #[error("executable not found: {0}")]
    BinaryNotFound(String),

    /// Spawning the OpenVPN subprocess failed
    #[error("failed to spawn OpenVPN: {0}")]
    Spawn(#[source] std::io::Error),

    /// Management channel protocol or timeout error
    #[error("management channel error: {0}")]
    Management(String),

    /// The subprocess survived both graceful and forced termination
    #[error("subprocess did not exit within the termination deadline")]
    TerminationTimeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
