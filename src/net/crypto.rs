//! Translation between network bytes and application bytes.
//!
//! # Responsibilities
//! - Define the pluggable [`CryptoEngine`] contract (wrap, unwrap, handshake)
//! - Push received bytes through an engine into application data
//! - Push queued application data through an engine into network bytes
//! - Copy verbatim when a channel has no engine
//!
//! # Data Flow
//! ```text
//! read buffer  → to_application_data   → application data → DataListener
//! write queue  → from_application_data → write buffer     → socket
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::CryptoError;
use crate::net::buffer::{grow, NetBuffer};

/// Outcome of one wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The call completed; `produced` may be zero.
    Ok,
    /// The destination was too small for what the engine has to produce.
    BufferOverflow,
    /// The source does not yet hold a complete record.
    BufferUnderflow,
    /// The engine has closed in this direction.
    Closed,
}

/// Result of one wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: Status,
    /// Bytes taken from the source.
    pub consumed: usize,
    /// Bytes written into the destination.
    pub produced: usize,
}

impl EngineResult {
    pub fn new(status: Status, consumed: usize, produced: usize) -> Self {
        Self {
            status,
            consumed,
            produced,
        }
    }
}

/// What an engine needs next to make handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// A delegated task must run before anything else can happen.
    NeedTask,
    /// The engine has records to send.
    NeedWrap,
    /// The engine is waiting for records from the peer.
    NeedUnwrap,
    /// The handshake just completed.
    Finished,
    /// No handshake is in progress.
    NotHandshaking,
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStatus::NeedTask => "NEED_TASK",
            HandshakeStatus::NeedWrap => "NEED_WRAP",
            HandshakeStatus::NeedUnwrap => "NEED_UNWRAP",
            HandshakeStatus::Finished => "FINISHED",
            HandshakeStatus::NotHandshaking => "NOT_HANDSHAKING",
        };
        f.write_str(name)
    }
}

/// Long-running work an engine hands off to another thread.
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// A record-oriented secure channel protocol, driven one buffer at a time.
///
/// Implementations are owned by exactly one channel and are only called
/// from the event loop (and from `close` on a caller thread).
pub trait CryptoEngine: Send {
    /// Decode network bytes from `src` into application bytes in `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, CryptoError>;

    /// Encode application bytes from `src` into network bytes in `dst`.
    ///
    /// Called with an empty `src` whenever the engine may have protocol
    /// records of its own to send.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, CryptoError>;

    fn handshake_status(&mut self) -> HandshakeStatus;

    /// Take the next delegated task, if the engine offers one.
    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    /// No more network bytes will arrive.
    fn close_inbound(&mut self);

    /// Send the protocol's closure message and accept no more application data.
    fn close_outbound(&mut self);
}

/// Derives engines for new channels.
pub trait EngineFactory: Send + Sync {
    /// An engine for a connection accepted by a listener.
    fn server_engine(&self) -> Result<Box<dyn CryptoEngine>, CryptoError>;

    /// An engine for an outbound connection.
    fn client_engine(&self) -> Result<Box<dyn CryptoEngine>, CryptoError>;
}

/// Encryption configuration passed to `bind` and `connect`.
pub type Encryption = Arc<dyn EngineFactory>;

/// A destination buffer after translation, possibly reallocated.
#[derive(Debug)]
pub struct Translation {
    /// Always use this buffer in place of the one passed in.
    pub buffer: NetBuffer,
    /// The engine reported closure in this direction.
    pub closed: bool,
}

/// Convert received network bytes in `source` into application bytes.
///
/// Bytes the engine could not consume (an incomplete record) stay in
/// `source` for the next read.
pub fn to_application_data(
    source: &mut NetBuffer,
    data: NetBuffer,
    engine: Option<&mut (dyn CryptoEngine + '_)>,
    increment: usize,
) -> Result<Translation, CryptoError> {
    match engine {
        Some(engine) => translate(source, data, increment, |src, dst| engine.unwrap(src, dst)),
        None => Ok(copy_verbatim(source, data, increment)),
    }
}

/// Convert queued application bytes in `source` into network bytes.
pub fn from_application_data(
    source: &mut NetBuffer,
    out: NetBuffer,
    engine: Option<&mut (dyn CryptoEngine + '_)>,
    increment: usize,
) -> Result<Translation, CryptoError> {
    match engine {
        Some(engine) => translate(source, out, increment, |src, dst| engine.wrap(src, dst)),
        None => Ok(copy_verbatim(source, out, increment)),
    }
}

fn translate(
    source: &mut NetBuffer,
    mut buffer: NetBuffer,
    increment: usize,
    mut step: impl FnMut(&[u8], &mut [u8]) -> Result<EngineResult, CryptoError>,
) -> Result<Translation, CryptoError> {
    loop {
        let result = {
            let spare = buffer.spare_mut();
            step(source.chunk(), spare)?
        };
        source.advance(result.consumed);
        buffer.commit(result.produced);

        match result.status {
            Status::BufferOverflow => {
                tracing::trace!(
                    capacity = buffer.capacity(),
                    increment,
                    "Engine output overflow, growing buffer"
                );
                buffer = grow(buffer, increment.max(1));
            }
            Status::BufferUnderflow | Status::Ok => {
                return Ok(Translation {
                    buffer,
                    closed: false,
                })
            }
            Status::Closed => {
                return Ok(Translation {
                    buffer,
                    closed: true,
                })
            }
        }
    }
}

fn copy_verbatim(source: &mut NetBuffer, mut buffer: NetBuffer, increment: usize) -> Translation {
    if buffer.remaining() < source.len() {
        let shortfall = source.len() - buffer.remaining();
        buffer = grow(buffer, shortfall.max(increment));
    }
    let copied = buffer.put(source.chunk());
    source.advance(copied);
    Translation {
        buffer,
        closed: false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Replays scripted results, copying bytes the way a pass-through
    /// engine would.
    struct ScriptedEngine {
        script: VecDeque<Status>,
        calls: usize,
    }

    impl ScriptedEngine {
        fn new(script: &[Status]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                calls: 0,
            }
        }

        fn step(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, CryptoError> {
            self.calls += 1;
            let status = self.script.pop_front().unwrap_or(Status::Ok);
            match status {
                Status::BufferOverflow => Ok(EngineResult::new(status, 0, 0)),
                Status::BufferUnderflow => Ok(EngineResult::new(status, 0, 0)),
                Status::Ok | Status::Closed => {
                    let n = src.len().min(dst.len());
                    dst[..n].copy_from_slice(&src[..n]);
                    Ok(EngineResult::new(status, n, n))
                }
            }
        }
    }

    impl CryptoEngine for ScriptedEngine {
        fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, CryptoError> {
            self.step(src, dst)
        }

        fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, CryptoError> {
            self.step(src, dst)
        }

        fn handshake_status(&mut self) -> HandshakeStatus {
            HandshakeStatus::NotHandshaking
        }

        fn close_inbound(&mut self) {}

        fn close_outbound(&mut self) {}
    }

    fn filled(bytes: &[u8]) -> NetBuffer {
        let mut buffer = NetBuffer::with_capacity(bytes.len());
        buffer.put(bytes);
        buffer
    }

    #[test]
    fn plaintext_copies_and_grows() {
        let mut source = filled(b"0123456789");
        let translation =
            to_application_data(&mut source, NetBuffer::with_capacity(4), None, 4).unwrap();
        assert_eq!(translation.buffer.chunk(), b"0123456789");
        assert!(translation.buffer.capacity() >= 10);
        assert!(source.is_empty());
        assert!(!translation.closed);
    }

    #[test]
    fn overflow_grows_and_retries() {
        let mut engine = ScriptedEngine::new(&[Status::BufferOverflow, Status::BufferOverflow]);
        let mut source = filled(b"abcdef");
        let translation = to_application_data(
            &mut source,
            NetBuffer::with_capacity(2),
            Some(&mut engine),
            2,
        )
        .unwrap();
        assert_eq!(engine.calls, 3);
        assert_eq!(translation.buffer.capacity(), 6);
        assert_eq!(translation.buffer.chunk(), b"abcdef");
    }

    #[test]
    fn underflow_leaves_source_bytes() {
        let mut engine = ScriptedEngine::new(&[Status::BufferUnderflow]);
        let mut source = filled(b"partial");
        let translation = to_application_data(
            &mut source,
            NetBuffer::with_capacity(16),
            Some(&mut engine),
            16,
        )
        .unwrap();
        assert_eq!(engine.calls, 1);
        assert!(translation.buffer.is_empty());
        assert_eq!(source.chunk(), b"partial");
    }

    #[test]
    fn closure_is_reported() {
        let mut engine = ScriptedEngine::new(&[Status::Closed]);
        let mut source = filled(b"bye");
        let translation = from_application_data(
            &mut source,
            NetBuffer::with_capacity(16),
            Some(&mut engine),
            16,
        )
        .unwrap();
        assert!(translation.closed);
        assert_eq!(translation.buffer.chunk(), b"bye");
    }

    #[test]
    fn zero_output_is_accepted() {
        let mut engine = ScriptedEngine::new(&[Status::Ok]);
        let mut source = NetBuffer::with_capacity(4);
        let translation = from_application_data(
            &mut source,
            NetBuffer::with_capacity(4),
            Some(&mut engine),
            4,
        )
        .unwrap();
        assert_eq!(engine.calls, 1);
        assert!(translation.buffer.is_empty());
        assert!(!translation.closed);
    }
}
