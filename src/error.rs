//! Error types for the beamlink crate.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Crate-level error type.
///
/// Per-device failures are isolated to that device's session; transient
/// socket errors during discovery or streaming are logged and contained
/// rather than surfaced, so the variants here cover the operations that have
/// a caller waiting on a result.
#[derive(Debug)]
pub enum Error {
    /// Establishing the device connection failed (refused, unreachable, or
    /// the connect timeout elapsed). The caller may retry by calling again;
    /// the engine does not auto-retry.
    ConnectFailed(String),

    /// The device disconnected or became unreachable mid-session.
    Disconnected(String),

    /// A request received no reply within its bounded window.
    Timeout,

    /// Underlying I/O error.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            Error::Disconnected(msg) => write!(f, "disconnected: {}", msg),
            Error::Timeout => write!(f, "timed out waiting for a reply"),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    /// Create a connect-failed error with a message.
    pub fn connect_failed(msg: impl Into<String>) -> Self {
        Error::ConnectFailed(msg.into())
    }

    /// Create a disconnected error with a message.
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Error::Disconnected(msg.into())
    }

    /// Returns true if this is a Timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Io(err),
        }
    }
}

/// Result type for beamlink operations.
pub type Result<T> = std::result::Result<T, Error>;
