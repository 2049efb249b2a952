//! Error types for exec sessions.

use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors surfaced by an exec session.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command has already finished; there is nothing left to signal.
    /// Mirrors signalling an already-reaped process.
    #[error("no such process")]
    NoSuchProcess,

    /// A control request could not be delivered or was rejected by the
    /// guest side.
    #[error("control request failed: {0}")]
    Control(#[source] std::io::Error),

    /// The underlying operation failed for a reason other than the guest
    /// link dropping.
    #[error("exec operation failed: {0}")]
    Operation(#[source] std::io::Error),

    /// The link to the guest died mid-session; the command's real outcome
    /// is unknown. Distinct from a non-zero exit so callers never mistake
    /// a dead channel for a failed command.
    #[error("execution session disconnected")]
    SessionDisconnected {
        /// Last exit code known for the session; -1 when none was seen.
        code: i64,
    },

    /// The command was not found inside the guest.
    #[error("command not found")]
    CommandNotFound {
        /// The shell convention exit code reported by the guest (127).
        code: i64,
    },

    /// The command exists inside the guest but is not executable.
    #[error("command not executable")]
    CommandNotExecutable {
        /// The shell convention exit code reported by the guest (126).
        code: i64,
    },
}

impl ExecError {
    /// Numeric exit code carried alongside the semantic error, if any.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i64> {
        match self {
            Self::SessionDisconnected { code }
            | Self::CommandNotFound { code }
            | Self::CommandNotExecutable { code } => Some(*code),
            Self::NoSuchProcess | Self::Control(_) | Self::Operation(_) => None,
        }
    }
}
