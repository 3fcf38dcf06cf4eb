//! Single-threaded, non-blocking TCP network engine with optional TLS.
//!
//! One event-loop thread multiplexes every listening and connected socket
//! through a readiness selector; callers on any thread bind, connect, queue
//! bytes and close channels through a cloneable [`Network`] handle and
//! observe the results through registered listeners.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;

pub use config::schema::NetworkConfig;
pub use error::{CryptoError, Error, Result};
pub use net::{
    ChannelId, ConnectionStateListener, DataListener, Encryption, Network, Ops,
    ServerStateListener, StatePoller, TlsSettings,
};
