//! Error taxonomy shared by every runtime component.

use std::io;
use thiserror::Error;

/// Errors surfaced by runtime operations.
///
/// Variants are semantic kinds rather than per-module types; callers match on
/// the kind to decide between retrying, backing off, or tearing down.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value was malformed (bad capacity, bad header, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded resource (queue, ring, pool) refused the operation.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A deadline elapsed before the operation completed.
    #[error("deadline elapsed")]
    Timeout,

    /// The feature was disabled at build time or is unavailable on this host.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// An explicit lookup missed.
    #[error("not found: {0}")]
    NotFound(String),

    /// The transport was shut down; no further I/O is possible.
    #[error("transport closed")]
    TransportClosed,

    /// The listener was shut down; no further accepts are possible.
    #[error("listener closed")]
    ListenerClosed,

    /// The executor refused a submission after close.
    #[error("executor closed")]
    ExecutorClosed,

    /// The connection was shut down.
    #[error("connection closed")]
    ConnectionClosed,

    /// A wire-protocol rule was violated by the peer.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An operating-system level I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns `true` if this error indicates the component is permanently
    /// unusable and the caller should tear down rather than retry.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed
                | Self::ListenerClosed
                | Self::ExecutorClosed
                | Self::ConnectionClosed
        )
    }

    /// Returns `true` if the operation may succeed when retried later.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::Timeout)
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(Error::TransportClosed.is_terminal());
        assert!(Error::ExecutorClosed.is_terminal());
        assert!(!Error::Timeout.is_terminal());
        assert!(!Error::Protocol("bad opcode".into()).is_terminal());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::ResourceExhausted("task queue full").is_recoverable());
        assert!(Error::Timeout.is_recoverable());
        assert!(!Error::ListenerClosed.is_recoverable());
    }
}
