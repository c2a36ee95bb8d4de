//! Error types for listener handoff.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Failure reported by a connection handler.
///
/// Handler errors are logged with the connection identity and never leave
/// the connection task.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while creating, serving, handing off or stopping a listener.
#[derive(Debug, Error)]
pub enum Error {
    /// A fresh listener could not be bound. Fatal at startup.
    #[error("failed to bind {network} listener on {address}: {source}")]
    Bind {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// An inherited descriptor is not a usable listening stream socket.
    /// Fatal at startup.
    #[error("inherited fd {fd} is not a listening stream socket: {reason}")]
    Inheritance { fd: RawFd, reason: String },

    /// The listener descriptor could not be exported for a successor.
    /// The restart attempt is abandoned and the generation keeps serving.
    #[error("failed to export listener descriptor: {0}")]
    Export(#[source] io::Error),

    /// The successor process could not be created.
    /// The restart attempt is abandoned and the generation keeps serving.
    #[error("failed to spawn successor {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A permanent accept failure. Ends the accept loop.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The listener was closed while (or before) accepting.
    #[error("listener closed")]
    ListenerClosed,

    /// The accept loop observed its cancellation token.
    #[error("serve cancelled")]
    Cancelled,

    /// An OS signal handler could not be registered.
    #[error("failed to register {signal} handler: {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Create an inheritance error for `fd`.
    pub fn inheritance(fd: RawFd, reason: impl Into<String>) -> Self {
        Self::Inheritance {
            fd,
            reason: reason.into(),
        }
    }

    /// Whether this error ends a serve loop as part of a normal shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ListenerClosed | Self::Cancelled)
    }
}

/// Classify an accept-time error as transient (retry) or permanent (stop).
///
/// Transient errors are the ones that concern a single pending connection
/// or a momentary resource shortage; the listening socket itself is fine.
pub fn is_transient_accept(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => matches!(
            err.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
        ),
    }
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_kinds() {
        assert!(is_transient_accept(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(is_transient_accept(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
    }

    #[test]
    fn test_permanent_accept_kinds() {
        assert!(!is_transient_accept(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
        assert!(!is_transient_accept(&io::Error::from_raw_os_error(
            libc::EINVAL
        )));
    }

    #[test]
    fn test_shutdown_errors() {
        assert!(Error::ListenerClosed.is_shutdown());
        assert!(Error::Cancelled.is_shutdown());
        assert!(!Error::Accept(io::Error::from_raw_os_error(libc::EBADF)).is_shutdown());
    }
}
