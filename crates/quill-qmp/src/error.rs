//! Error types for the QMP monitor.

use thiserror::Error;

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the QMP control channel.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level I/O failure on the monitor socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A request that could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer violated the framing contract; fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection is gone: explicitly closed, ended by the peer, or
    /// torn down after a stream fault. Distinct from [`Error::Protocol`]
    /// so callers can decide between reconnecting and giving up.
    #[error("monitor disconnected")]
    Disconnected,

    /// The command itself failed; the connection stays usable.
    #[error("command failed: {class}: {desc}")]
    Qmp {
        /// Error class reported by the hypervisor.
        class: String,
        /// Human-readable description.
        desc: String,
    },

    /// A reply arrived but its payload did not match the expected shape.
    #[error("unexpected return payload")]
    BadReturn,

    /// No character device matched the requested label.
    #[error("requested console does not exist")]
    BadConsole,

    /// The caller's deadline fired before the reply arrived.
    #[error("timed out waiting for reply")]
    Timeout,
}
