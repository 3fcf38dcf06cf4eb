//! Engine error types.
//!
//! Only the synchronous boundary calls (`bind`, `connect`, `queue`, `close`
//! and the lifecycle controls) return these to callers. Failures that happen
//! inside the event loop are logged and surface as `closed` notifications.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::validation::ValidationError;
use crate::net::ChannelId;

/// Convenience alias used throughout the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the network engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The selector is closed; call `bring_up` first.
    #[error("networking engine is not up")]
    NotUp,

    /// The event loop thread is already alive.
    #[error("network thread is already running")]
    AlreadyRunning,

    /// The configuration handed to the engine failed validation.
    #[error("invalid configuration: {}", join(.0))]
    InvalidConfig(Vec<ValidationError>),

    /// No usable socket address could be resolved.
    #[error("could not resolve a socket address from {0}")]
    Resolve(String),

    /// A listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: SocketAddr,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// An outbound connection could not be initiated.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The remote address.
        addr: SocketAddr,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The channel is not (or no longer) managed by this engine's selector.
    #[error("{0} is not a connection managed by this engine")]
    UnknownChannel(ChannelId),

    /// The channel's socket has already been closed.
    #[error("{0} has been closed")]
    ChannelClosed(ChannelId),

    /// The encryption engine failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Socket or selector I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised by an encryption engine or while building one.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// The TLS protocol state machine rejected the peer's records.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Reading or writing records through the engine failed.
    #[error("TLS I/O error: {0}")]
    Io(#[from] io::Error),

    /// Certificates, keys or names could not be turned into an engine configuration.
    #[error("invalid TLS configuration: {0}")]
    Config(String),

    /// The requested engine mode has no configuration.
    #[error("no {0} TLS configuration available")]
    MissingConfig(&'static str),
}

impl Error {
    /// Returns true if the error only concerns a single channel's socket,
    /// as opposed to the selector or the engine as a whole.
    pub fn is_channel_scoped(&self) -> bool {
        matches!(
            self,
            Error::UnknownChannel(_) | Error::ChannelClosed(_) | Error::Crypto(_)
        )
    }
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_channel() {
        let err = Error::UnknownChannel(ChannelId::from_raw(7));
        assert_eq!(err.to_string(), "ch-7 is not a connection managed by this engine");
    }

    #[test]
    fn bind_error_keeps_source() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = Error::Bind {
            addr,
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().starts_with("failed to bind 127.0.0.1:1"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn channel_scope() {
        assert!(Error::ChannelClosed(ChannelId::from_raw(1)).is_channel_scoped());
        assert!(!Error::NotUp.is_channel_scoped());
        assert!(Error::from(CryptoError::MissingConfig("server")).is_channel_scoped());
    }
}
