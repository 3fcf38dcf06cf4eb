//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Caller thread                         Event loop thread
//!   bind / connect ─┐                    event_loop.rs
//!   queue / close  ─┼→ network.rs  ←──→    → handshake.rs (engine needs)
//!   add/del ops    ─┘   (channel table)    → listener.rs (accept)
//!                                          → connection.rs (read, write, teardown)
//!                                          → crypto.rs / tls.rs (translation)
//!                                          → notify.rs (listener fan-out)
//! ```
//!
//! # Design Decisions
//! - One thread does all socket I/O; callers only touch per-channel locks
//! - Encryption is pluggable through [`CryptoEngine`]; TLS is one engine
//! - Interest changes always go through the selector's registration guard

pub mod buffer;
pub mod channel;
pub(crate) mod connection;
pub mod crypto;
pub(crate) mod event_loop;
pub(crate) mod handshake;
pub mod interest;
pub(crate) mod listener;
pub mod network;
pub mod notify;
pub mod poller;
pub mod tls;

pub use buffer::{grow, NetBuffer};
pub use channel::{ChannelId, ChannelKind};
pub use crypto::{
    from_application_data, to_application_data, CryptoEngine, DelegatedTask, Encryption,
    EngineFactory, EngineResult, HandshakeStatus, Status, Translation,
};
pub use interest::Ops;
pub use network::{resolve, Network};
pub use notify::{ConnectionStateListener, DataListener, ServerStateListener};
pub use poller::{NetworkState, StatePoller};
pub use tls::{TlsEngine, TlsSettings};
