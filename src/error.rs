//! The crate error type and the classification rules deciding which socket
//! errors are surfaced to handlers and which are expected parts of a
//! disconnect.

use std::io;

use thiserror::Error;

/// Errors surfaced by servers, clients, sessions, and datagram endpoints.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The endpoint is not connected (or, for TLS, not handshaked).
    #[error("endpoint is not connected")]
    NotConnected,
    /// The server or datagram endpoint is already started.
    #[error("endpoint is already started")]
    AlreadyStarted,
    /// The server or datagram endpoint has not been started.
    #[error("endpoint is not started")]
    NotStarted,
    /// The client is already connected; disconnect before reconnecting.
    #[error("client is already connected")]
    AlreadyConnected,
    /// A direct send was attempted while the buffered pipeline holds
    /// undelivered bytes.
    #[error("a buffered send is in flight")]
    SendInProgress,
    /// A buffered send would push the pending bytes past the configured
    /// limit.
    #[error("send buffer limit of {limit} bytes exceeded")]
    SendBufferLimit { limit: usize },
    /// The TLS handshake with the peer failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
    /// Certificate or key material was rejected while preparing a TLS
    /// configuration.
    #[error("invalid certificate chain or private key: {0}")]
    InvalidTlsMaterial(String),
    /// The TLS server name is not a valid DNS name.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
    /// A user callback panicked; the panic was contained at the dispatch
    /// boundary and the session disconnected.
    #[error("user callback panicked")]
    CallbackPanic,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for error kinds that are the expected face of a peer disconnect
    /// or a locally cancelled operation. These are filtered before anything
    /// reaches an `on_error` callback; the disconnect path reports them on
    /// its own terms.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(err) => is_disconnect_kind(err.kind()),
            _ => false,
        }
    }
}

/// Determine if an [`io::ErrorKind`] signals an expected disconnect rather
/// than a fault worth surfacing. The filtered set is exactly the aborted,
/// refused, and reset connection kinds; an aborted local operation has no
/// `ErrorKind` equivalent here because cancellation is structural and
/// produces no error. Everything else (`NotConnected`, `TimedOut`,
/// `HostUnreachable`, address errors, and the rest) passes through to
/// `on_error`.
pub(crate) fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_kinds_are_filtered() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
        ]
        .iter()
        {
            let error = Error::from(io::Error::from(*kind));
            assert!(error.is_disconnect(), "{:?} should be filtered", kind);
        }
    }

    #[test]
    fn other_kinds_pass_through() {
        for kind in [
            io::ErrorKind::NotConnected,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::TimedOut,
            io::ErrorKind::AddrInUse,
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidData,
        ]
        .iter()
        {
            let error = Error::from(io::Error::from(*kind));
            assert!(!error.is_disconnect(), "{:?} should surface", kind);
        }
        assert!(!Error::NotConnected.is_disconnect());
        assert!(!Error::CallbackPanic.is_disconnect());
    }
}
