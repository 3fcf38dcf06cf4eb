//! Per-channel state records.
//!
//! # Responsibilities
//! - Generate unique channel IDs for tracing and lookup
//! - Own the socket, its interest set and its encryption engine
//! - Embed the write-queue lock that serializes queueing and closing
//!
//! # Design Decisions
//! - Everything a channel owns lives in one record, so teardown removes it
//!   all at once by dropping the record from the channel table
//! - Lock order is queue → engine → io, never reversed

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::net::buffer::NetBuffer;
use crate::net::crypto::{CryptoEngine, Encryption};
use crate::net::interest::Ops;

/// Global atomic counter for channel IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CHANNEL_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Unique identifier for a channel managed by a [`Network`](crate::Network).
///
/// IDs are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(usize);

impl ChannelId {
    pub(crate) fn next() -> Self {
        Self(CHANNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw ID value.
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }
}

impl From<Token> for ChannelId {
    fn from(token: Token) -> Self {
        Self(token.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// What a channel's socket does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Produces new connections.
    Listener,
    /// Carries a bidirectional byte stream.
    Stream,
}

impl ChannelKind {
    /// The operations a channel of this kind may be registered for.
    pub fn valid_ops(self) -> Ops {
        match self {
            ChannelKind::Listener => Ops::ACCEPT,
            ChannelKind::Stream => Ops::CONNECT | Ops::READ | Ops::WRITE,
        }
    }
}

/// The OS socket behind a channel.
#[derive(Debug)]
pub(crate) enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Socket {
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Listener(listener) => listener.local_addr(),
            Socket::Stream(stream) => stream.local_addr(),
        }
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Listener(_) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listening sockets have no peer",
            )),
            Socket::Stream(stream) => stream.peer_addr(),
        }
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Socket::Listener(_) => Ok(()),
            Socket::Stream(stream) => stream.shutdown(how),
        }
    }
}

impl Source for Socket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Listener(listener) => listener.register(registry, token, interests),
            Socket::Stream(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Socket::Listener(listener) => listener.reregister(registry, token, interests),
            Socket::Stream(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Socket::Listener(listener) => listener.deregister(registry),
            Socket::Stream(stream) => stream.deregister(registry),
        }
    }
}

/// Socket state, touched by the loop and by callers changing interest.
#[derive(Debug)]
pub(crate) struct ChannelIo {
    /// `None` once the channel has been torn down.
    pub socket: Option<Socket>,
    /// Operations currently registered with the selector.
    pub interest: Ops,
    /// The TCP connection is established.
    pub connected: bool,
    /// Output has been shut down; nothing more may be written.
    pub output_shutdown: bool,
}

/// Application bytes waiting to be translated and written.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    /// Created by the first `queue` call.
    pub buffer: Option<NetBuffer>,
    /// `close` has been requested.
    pub closing: bool,
    /// Teardown has run; nothing may be queued any more.
    pub closed: bool,
}

impl WriteQueue {
    pub(crate) fn has_pending(&self) -> bool {
        self.buffer.as_ref().is_some_and(|buffer| !buffer.is_empty())
    }
}

/// Everything the engine keeps for one channel.
pub(crate) struct Channel {
    pub id: ChannelId,
    pub kind: ChannelKind,
    /// Encryption handed to connections accepted by a listener.
    pub encryption: Option<Encryption>,
    pub queue: Mutex<WriteQueue>,
    pub engine: Mutex<Option<Box<dyn CryptoEngine>>>,
    pub io: Mutex<ChannelIo>,
    /// A plaintext `close` shut the socket down and wants teardown.
    teardown_requested: AtomicBool,
}

impl Channel {
    pub(crate) fn listener(
        id: ChannelId,
        listener: TcpListener,
        encryption: Option<Encryption>,
    ) -> Self {
        Self::new(id, ChannelKind::Listener, Socket::Listener(listener), encryption, None)
    }

    pub(crate) fn stream(
        id: ChannelId,
        stream: TcpStream,
        engine: Option<Box<dyn CryptoEngine>>,
        connected: bool,
    ) -> Self {
        let channel = Self::new(id, ChannelKind::Stream, Socket::Stream(stream), None, engine);
        channel.io.lock().connected = connected;
        channel
    }

    fn new(
        id: ChannelId,
        kind: ChannelKind,
        socket: Socket,
        encryption: Option<Encryption>,
        engine: Option<Box<dyn CryptoEngine>>,
    ) -> Self {
        Self {
            id,
            kind,
            encryption,
            queue: Mutex::new(WriteQueue::default()),
            engine: Mutex::new(engine),
            io: Mutex::new(ChannelIo {
                socket: Some(socket),
                interest: Ops::NONE,
                connected: false,
                output_shutdown: false,
            }),
            teardown_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_encrypted(&self) -> bool {
        self.engine.lock().is_some()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.io.lock().connected
    }

    pub(crate) fn interest(&self) -> Ops {
        self.io.lock().interest
    }

    pub(crate) fn request_teardown(&self) {
        self.teardown_requested.store(true, Ordering::Release);
    }

    pub(crate) fn teardown_requested(&self) -> bool {
        self.teardown_requested.load(Ordering::Acquire)
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        match &self.io.lock().socket {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(Error::ChannelClosed(self.id)),
        }
    }

    pub(crate) fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.io.lock().socket {
            Some(socket) => Ok(socket.peer_addr()?),
            None => Err(Error::ChannelClosed(self.id)),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
