//! Listening sockets.
//!
//! # Responsibilities
//! - Bind to an address and register for accept readiness
//! - Accept every pending connection on readiness (the selector is edge-triggered)
//! - Derive a server-mode engine per accepted connection
//! - Graceful handling of accept errors

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpListener;

use crate::error::{Error, Result};
use crate::net::channel::{Channel, ChannelId, Socket};
use crate::net::crypto::Encryption;
use crate::net::interest::Ops;
use crate::net::network::Shared;
use crate::observability::metrics;

impl Shared {
    pub(crate) fn bind(
        &self,
        addr: SocketAddr,
        encryption: Option<Encryption>,
    ) -> Result<ChannelId> {
        self.selector()?;
        // Fail here rather than on the first accept.
        if let Some(factory) = &encryption {
            factory.server_engine()?;
        }

        let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        let id = ChannelId::next();
        let channel = Arc::new(Channel::listener(id, listener, encryption));
        self.channels.insert(id, channel.clone());
        if let Err(e) = self.update_ops(&channel, |_| Ops::ACCEPT) {
            self.channels.remove(&id);
            return Err(e);
        }

        let address = channel.local_addr().map(|a| a.to_string()).unwrap_or_default();
        tracing::info!(
            channel = %id,
            address = %address,
            encrypted = channel.encryption.is_some(),
            "Listener bound"
        );
        metrics::record_connection_event("bound");
        metrics::set_open_channels(self.channels.len());
        self.listeners.bound(id);
        Ok(id)
    }

    /// Accept every connection pending on `listener`.
    pub(crate) fn accept(&self, listener: &Channel) -> Result<()> {
        loop {
            let accepted = {
                let io = listener.io.lock();
                match &io.socket {
                    Some(Socket::Listener(socket)) => socket.accept(),
                    _ => return Err(Error::ChannelClosed(listener.id)),
                }
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    tracing::debug!(channel = %listener.id, error = %e, "Transient accept error");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let engine = match &listener.encryption {
                Some(factory) => match factory.server_engine() {
                    Ok(engine) => Some(engine),
                    Err(e) => {
                        tracing::warn!(
                            channel = %listener.id,
                            peer = %peer,
                            error = %e,
                            "Dropping connection, no server engine"
                        );
                        continue;
                    }
                },
                None => None,
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "Failed to disable Nagle");
            }

            let id = ChannelId::next();
            let channel = Arc::new(Channel::stream(id, stream, engine, true));
            self.channels.insert(id, channel.clone());
            if let Err(e) = self.update_ops(&channel, |_| Ops::READ) {
                // Later connections in the backlog get no new readiness edge.
                self.channels.remove(&id);
                tracing::warn!(
                    channel = %listener.id,
                    peer = %peer,
                    error = %e,
                    "Dropping connection, registration failed"
                );
                continue;
            }

            tracing::info!(
                listener = %listener.id,
                channel = %id,
                peer = %peer,
                encrypted = channel.is_encrypted(),
                "Connection accepted"
            );
            metrics::record_connection_event("accepted");
            metrics::set_open_channels(self.channels.len());
            self.listeners.accepted(listener.id, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use super::*;
    use crate::config::NetworkConfig;

    #[test]
    fn failed_registration_keeps_draining_the_backlog() {
        // No selector is open, so registering every accepted stream fails.
        let shared = Shared::new(NetworkConfig::default());
        let socket = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let listener = Channel::listener(ChannelId::next(), socket, None);

        let mut peers: Vec<_> = (0..3)
            .map(|_| std::net::TcpStream::connect(addr).unwrap())
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        shared.accept(&listener).unwrap();
        assert!(shared.channels.is_empty());

        for peer in &mut peers {
            peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0u8; 1];
            assert_eq!(peer.read(&mut buf).unwrap(), 0, "connection left in the backlog");
        }
    }
}
