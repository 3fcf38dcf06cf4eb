//! Connection sockets: connect, read, write, queue and teardown.
//!
//! # Responsibilities
//! - Initiate outbound connections and complete them when the OS reports it
//! - Drain sockets into read buffers and push bytes through the crypto layer
//! - Stage queued application data and flush it to the socket
//! - Tear every per-channel object down together
//!
//! # Design Decisions
//! - `read` and `write` run only on the loop thread and own their buffers
//!   through [`StreamBuffers`], which the loop keeps outside the channel
//! - Closure is recorded in [`Closures`] and acted on once per iteration,
//!   so a channel is never torn down halfway through dispatch
//! - Listeners are notified with no channel lock held

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use mio::net::TcpStream;

use crate::error::{Error, Result};
use crate::net::buffer::{grow, NetBuffer};
use crate::net::channel::{Channel, ChannelId, ChannelKind, Socket};
use crate::net::crypto::{from_application_data, to_application_data, Encryption, Translation};
use crate::net::interest::{Ops, Selector};
use crate::net::network::Shared;
use crate::observability::diagnostics::BufferGauge;
use crate::observability::metrics;

/// Loop-owned buffers of one connection, created lazily.
#[derive(Debug, Default)]
pub(crate) struct StreamBuffers {
    /// Network bytes read but not yet translated.
    pub read: Option<NetBuffer>,
    /// Network bytes translated but not yet written.
    pub write: Option<NetBuffer>,
    /// Scratch space for translated application data.
    pub data: Option<NetBuffer>,
}

impl StreamBuffers {
    pub(crate) fn has_unread(&self) -> bool {
        self.read.as_ref().is_some_and(|buffer| !buffer.is_empty())
    }

    pub(crate) fn has_unwritten(&self) -> bool {
        self.write.as_ref().is_some_and(|buffer| !buffer.is_empty())
    }
}

/// Channels marked closed during one loop iteration.
///
/// The value is the direction: true when the peer initiated the closure.
#[derive(Debug, Default)]
pub(crate) struct Closures(HashMap<ChannelId, bool>);

impl Closures {
    /// Mark `channel` closed. The first direction recorded wins.
    pub(crate) fn mark(&mut self, channel: ChannelId, reset_by_peer: bool) {
        self.0.entry(channel).or_insert(reset_by_peer);
    }

    pub(crate) fn contains(&self, channel: ChannelId) -> bool {
        self.0.contains_key(&channel)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn drain(&mut self) -> Vec<(ChannelId, bool)> {
        self.0.drain().collect()
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(ChannelId) -> bool) {
        self.0.retain(|channel, _| keep(*channel));
    }
}

/// Where a pending connect stands.
#[derive(Debug)]
pub(crate) enum ConnectProgress {
    Connected,
    /// Still in progress; try again on the next connect readiness.
    Pending,
    Failed(io::Error),
}

impl Shared {
    pub(crate) fn connect(
        &self,
        addr: SocketAddr,
        encryption: Option<Encryption>,
    ) -> Result<ChannelId> {
        self.selector()?;
        let engine = encryption.map(|factory| factory.client_engine()).transpose()?;
        let stream = TcpStream::connect(addr).map_err(|source| Error::Connect { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(address = %addr, error = %e, "Failed to disable Nagle");
        }

        let id = ChannelId::next();
        let channel = Arc::new(Channel::stream(id, stream, engine, false));
        self.channels.insert(id, channel.clone());
        tracing::info!(
            channel = %id,
            address = %addr,
            encrypted = channel.is_encrypted(),
            "Connecting"
        );

        let outcome = match self.finish_connect(&channel) {
            Ok(ConnectProgress::Connected) => Ok(id),
            Ok(ConnectProgress::Pending) => self.update_ops(&channel, |_| Ops::CONNECT).map(|_| id),
            Ok(ConnectProgress::Failed(source)) => Err(Error::Connect { addr, source }),
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            self.channels.remove(&id);
        }
        metrics::set_open_channels(self.channels.len());
        outcome
    }

    /// Complete a pending connect if the OS says it is done.
    pub(crate) fn finish_connect(&self, channel: &Channel) -> Result<ConnectProgress> {
        let mut io = channel.io.lock();
        if io.connected {
            return Ok(ConnectProgress::Connected);
        }
        let Some(Socket::Stream(stream)) = &io.socket else {
            return Err(Error::ChannelClosed(channel.id));
        };
        if let Some(e) = stream.take_error()? {
            return Ok(ConnectProgress::Failed(e));
        }
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                return Ok(ConnectProgress::Pending)
            }
            Err(e) => return Ok(ConnectProgress::Failed(e)),
        };
        io.connected = true;
        drop(io);

        self.update_ops(channel, |ops| (ops & !Ops::CONNECT) | Ops::READ)?;
        tracing::info!(channel = %channel.id, peer = %peer, "Connected");
        metrics::record_connection_event("connected");
        self.listeners.connected(channel.id);
        Ok(ConnectProgress::Connected)
    }

    /// Drain the socket and hand whatever application data results to the
    /// data listeners.
    pub(crate) fn read(
        &self,
        channel: &Channel,
        buffers: &mut StreamBuffers,
        closures: &mut Closures,
    ) -> Result<()> {
        if closures.contains(channel.id) {
            return Ok(());
        }
        let increment = self.config.buffers.read_increment;
        let mut read = buffers
            .read
            .take()
            .unwrap_or_else(|| NetBuffer::with_capacity(increment));

        let mut total = 0;
        let mut eof = false;
        {
            let mut io = channel.io.lock();
            if !io.connected {
                buffers.read = Some(read);
                return Ok(());
            }
            let Some(Socket::Stream(stream)) = io.socket.as_mut() else {
                buffers.read = Some(read);
                return Err(Error::ChannelClosed(channel.id));
            };
            loop {
                if read.is_full() {
                    read = grow(read, increment);
                }
                match read.fill_from(stream) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => total += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(channel = %channel.id, error = %e, "Read failed");
                        eof = true;
                        break;
                    }
                }
            }
        }
        if total > 0 {
            tracing::debug!(channel = %channel.id, bytes = total, "Read from socket");
            metrics::record_bytes_read(total);
        }

        let data = buffers
            .data
            .take()
            .unwrap_or_else(|| NetBuffer::with_capacity(increment));
        let translation = if read.is_empty() {
            Ok(Translation {
                buffer: data,
                closed: false,
            })
        } else {
            let mut engine = channel.engine.lock();
            to_application_data(&mut read, data, engine.as_deref_mut(), increment)
        };
        tracing::trace!(channel = %channel.id, read = %BufferGauge(&read), "Read buffer");
        buffers.read = Some(read);

        let translation = match translation {
            Ok(translation) => translation,
            Err(e) => {
                tracing::warn!(channel = %channel.id, error = %e, "Failed to decode received data");
                closures.mark(channel.id, true);
                return Ok(());
            }
        };

        let mut data = translation.buffer;
        if !data.is_empty() {
            tracing::debug!(channel = %channel.id, bytes = data.len(), "Received application data");
            self.listeners.received(data.chunk(), channel.id);
            data.clear();
        }
        buffers.data = Some(data);

        if eof || translation.closed {
            closures.mark(channel.id, true);
        }
        Ok(())
    }

    /// Translate queued application data and write what the socket takes.
    pub(crate) fn write(
        &self,
        channel: &Channel,
        buffers: &mut StreamBuffers,
        closures: &mut Closures,
    ) -> Result<()> {
        if closures.contains(channel.id) {
            return Ok(());
        }
        let mut queue = channel.queue.lock();
        {
            let io = channel.io.lock();
            if !io.connected || io.output_shutdown || io.socket.is_none() {
                return Ok(());
            }
        }

        let increment = self.config.buffers.write_increment;
        let out = buffers
            .write
            .take()
            .unwrap_or_else(|| NetBuffer::with_capacity(increment));
        let mut nothing = NetBuffer::with_capacity(0);
        let translation = {
            let source = queue.buffer.as_mut().unwrap_or(&mut nothing);
            let mut engine = channel.engine.lock();
            from_application_data(source, out, engine.as_deref_mut(), increment)
        };
        let translation = match translation {
            Ok(translation) => translation,
            Err(e) => {
                tracing::warn!(channel = %channel.id, error = %e, "Failed to encode queued data");
                closures.mark(channel.id, false);
                return Ok(());
            }
        };

        let mut out = translation.buffer;
        let mut written = 0;
        let mut failed = false;
        {
            let mut io = channel.io.lock();
            if let Some(Socket::Stream(stream)) = io.socket.as_mut() {
                while !out.is_empty() {
                    match out.drain_to(stream) {
                        Ok(0) => break,
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::debug!(channel = %channel.id, error = %e, "Write failed");
                            failed = true;
                            break;
                        }
                    }
                }
            }
        }
        if written > 0 {
            tracing::debug!(channel = %channel.id, bytes = written, "Wrote to socket");
            metrics::record_bytes_written(written);
        }
        tracing::trace!(channel = %channel.id, write = %BufferGauge(&out), "Write buffer");

        let drained = out.is_empty();
        buffers.write = Some(out);
        if failed {
            closures.mark(channel.id, true);
            return Ok(());
        }

        if drained && !queue.has_pending() {
            self.update_ops(channel, |ops| ops & !Ops::WRITE)?;
        } else {
            self.update_ops(channel, |ops| ops | Ops::WRITE)?;
        }
        if translation.closed && drained {
            closures.mark(channel.id, false);
        }
        Ok(())
    }

    /// Append `data` to the channel's write queue.
    pub(crate) fn queue(&self, data: &[u8], id: ChannelId) -> Result<()> {
        let channel = self
            .channel(id)
            .filter(|channel| channel.kind == ChannelKind::Stream)
            .ok_or(Error::UnknownChannel(id))?;

        let mut queue = channel.queue.lock();
        if queue.closing || queue.closed {
            return Err(Error::ChannelClosed(id));
        }

        let increment = self.config.buffers.write_queue_increment;
        let mut buffer = match queue.buffer.take() {
            None => NetBuffer::with_capacity(data.len().max(increment)),
            Some(buffer) if buffer.remaining() < data.len() => {
                let wanted = (data.len() + buffer.len()).max(buffer.capacity() + increment);
                let extra = wanted - buffer.capacity();
                grow(buffer, extra)
            }
            Some(buffer) => buffer,
        };
        buffer.put(data);
        let pending = buffer.len();
        queue.buffer = Some(buffer);
        tracing::debug!(channel = %id, bytes = data.len(), pending, "Queued application data");

        self.update_ops(&channel, |ops| ops | Ops::WRITE)
    }

    /// Request a graceful close.
    ///
    /// Encrypted connections flush the engine's closure message first; all
    /// others are shut down now and torn down on the next loop pass.
    pub(crate) fn close(&self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channel(id) else {
            return Ok(());
        };
        let selector = self.selector()?;

        if channel.kind == ChannelKind::Listener {
            channel.request_teardown();
            selector.wake();
            return Ok(());
        }

        let mut queue = channel.queue.lock();
        if queue.closing || queue.closed {
            return Ok(());
        }
        queue.closing = true;

        if channel.is_encrypted() && channel.is_connected() {
            if let Some(engine) = channel.engine.lock().as_mut() {
                engine.close_outbound();
            }
            tracing::debug!(channel = %id, "Closing encrypted connection");
            return self.update_ops(&channel, |ops| ops | Ops::WRITE);
        }

        {
            let mut io = channel.io.lock();
            if let Some(socket) = &io.socket {
                if let Err(e) = socket.shutdown(Shutdown::Both) {
                    tracing::debug!(channel = %id, error = %e, "Socket shutdown failed");
                }
            }
            io.output_shutdown = true;
        }
        channel.request_teardown();
        selector.wake();
        Ok(())
    }

    /// Tear `channel` down: engine, socket, registration and queue.
    ///
    /// Runs at most once per channel; later calls find it gone from the
    /// table and return.
    pub(crate) fn close_channel(
        &self,
        channel: &Channel,
        reset_by_peer: bool,
        selector: &Selector,
    ) {
        if self.channels.remove(&channel.id).is_none() {
            return;
        }

        {
            let mut queue = channel.queue.lock();
            if let Some(mut engine) = channel.engine.lock().take() {
                if reset_by_peer {
                    engine.close_inbound();
                } else {
                    engine.close_outbound();
                }
            }

            let mut io = channel.io.lock();
            let current = io.interest;
            if let Some(mut socket) = io.socket.take() {
                let token = channel.id.token();
                if let Err(e) = selector.apply(&mut socket, token, current, Ops::NONE) {
                    tracing::debug!(channel = %channel.id, error = %e, "Deregistration failed");
                }
            }
            io.interest = Ops::NONE;
            io.connected = false;
            queue.buffer = None;
            queue.closed = true;
        }

        tracing::info!(
            channel = %channel.id,
            kind = ?channel.kind,
            reset_by_peer,
            "Channel closed"
        );
        metrics::record_connection_event("closed");
        metrics::set_open_channels(self.channels.len());

        if channel.kind == ChannelKind::Stream {
            self.listeners.closed(channel.id, reset_by_peer);
        }
    }
}
