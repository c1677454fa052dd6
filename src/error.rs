//! The three-way error taxonomy the rest of the crate reports through (fatal, protocol, and
//! transient, per the design's error handling policy).

use std::io;

/// Negative wire error codes, used in the `err` field of a subchannel response when the failure
/// isn't a raw `errno`.
pub mod wire {
    pub const INVALID_REQUEST: i32 = -1;
}

/// Errors that can occur while servicing a connection.
///
/// [`HelperError::Fatal`] indicates a violation of an invariant this process relies on for
/// correctness (double registration of a pid, a write that should be async-signal-safe failing
/// for any reason but `EPIPE`, ...); the only safe response is to log and terminate the process,
/// since continuing risks acting on a recycled pid.
///
/// [`HelperError::Protocol`] indicates the peer sent something malformed; the connection is kept
/// alive and the offending request is answered with the carried wire code.
///
/// [`HelperError::Io`] wraps a syscall failure that's surfaced to the peer as an errno (`fork`,
/// `exec`, `dup2`, `chdir` failures) rather than killing the connection or the process.
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("fatal helper invariant violated: {0}")]
    Fatal(String),

    #[error("protocol violation: {message} (wire code {wire_code})")]
    Protocol { message: String, wire_code: i32 },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl HelperError {
    pub fn protocol(message: impl Into<String>, wire_code: i32) -> Self {
        Self::Protocol {
            message: message.into(),
            wire_code,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// The value to put in a subchannel response's `err` field for this error, if it is the
    /// kind of error that gets reported that way rather than killing the connection or process.
    pub fn wire_code(&self) -> i32 {
        match self {
            Self::Protocol { wire_code, .. } => *wire_code,
            Self::Io(e) => e.raw_os_error().unwrap_or(wire::INVALID_REQUEST),
            Self::Nix(e) => *e as i32,
            Self::Fatal(_) => wire::INVALID_REQUEST,
        }
    }
}

pub type Result<T> = std::result::Result<T, HelperError>;
