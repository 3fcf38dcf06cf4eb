//! The network thread.
//!
//! # Data Flow
//! ```text
//! wait for selector → handshakes → pending buffers → poll
//!     → accept / finish connect / read / write per ready channel
//!     → teardown of channels marked closed
//! ```
//!
//! # Design Decisions
//! - Read, write and data buffers belong to the loop, keyed by channel, and
//!   are pruned as soon as a channel leaves the table
//! - Failed iterations are logged and throttled; panics are caught so one
//!   bad listener cannot kill the thread

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll};

use crate::error::Result;
use crate::lifecycle::LoopState;
use crate::net::channel::{Channel, ChannelId, ChannelKind};
use crate::net::connection::{Closures, ConnectProgress, StreamBuffers};
use crate::net::handshake::{self, TaskRunner};
use crate::net::interest::{Ops, Selector, WAKE_TOKEN};
use crate::net::network::Shared;
use crate::observability::diagnostics::KeyStates;
use crate::observability::metrics;
use crate::resilience::ErrorThrottle;

pub(crate) struct EventLoop {
    shared: Arc<Shared>,
    /// The poll the loop is attached to, with the selector opened over it.
    poll: Option<(Poll, Arc<Selector>)>,
    events: Events,
    buffers: HashMap<ChannelId, StreamBuffers>,
    closures: Closures,
    throttle: ErrorThrottle,
    runner: TaskRunner,
    diagnostics: Option<KeyStates>,
}

impl EventLoop {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let config = &shared.config;
        let events = Events::with_capacity(config.event_loop.event_capacity);
        let throttle = ErrorThrottle::from_config(&config.event_loop);
        let runner = TaskRunner::new(config.event_loop.handshake_task_limit);
        let diagnostics = config
            .observability
            .key_state_diagnostics
            .then(KeyStates::new);
        Self {
            shared,
            poll: None,
            events,
            buffers: HashMap::new(),
            closures: Closures::default(),
            throttle,
            runner,
            diagnostics,
        }
    }

    pub(crate) fn run(mut self) {
        *self.shared.state.lock() = LoopState::Running;
        tracing::info!("Event loop started");

        while !self.shared.shutdown.is_triggered() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.iterate()));
            let failed = match outcome {
                Ok(Ok(())) => {
                    self.throttle.success();
                    continue;
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Event loop iteration failed");
                    true
                }
                Err(payload) => {
                    let message = panic_message(&*payload);
                    tracing::error!(panic = %message, "Event loop iteration panicked");
                    true
                }
            };
            if failed {
                metrics::record_loop_error();
                if let Some(delay) = self.throttle.failure() {
                    tracing::warn!(
                        failures = self.throttle.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Error budget exhausted, backing off"
                    );
                    self.shared.shutdown.wait_timeout(delay);
                }
            }
        }

        self.poll = None;
        *self.shared.state.lock() = LoopState::Stopped;
        tracing::info!("Event loop stopped");
    }

    fn iterate(&mut self) -> Result<()> {
        let Some(selector) = self.attach() else {
            return Ok(());
        };
        self.prune();

        let channels = self.shared.snapshot();
        let statuses =
            handshake::process_handshakes(&self.shared, &channels, &self.runner, &selector)?;
        if let Some(diagnostics) = self.diagnostics.as_mut() {
            for (channel, status) in statuses {
                diagnostics.observe_handshake(channel, status);
            }
        }
        self.process_buffers(&channels)?;

        let teardown_pending = !self.closures.is_empty()
            || channels.iter().any(|channel| channel.teardown_requested());
        let timeout = if teardown_pending {
            Some(Duration::ZERO)
        } else {
            self.shared.config.event_loop.poll_timeout()
        };
        if let Some((poll, _)) = self.poll.as_mut() {
            match poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    tracing::warn!("Selector wait interrupted");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut first_error = None;
        for (id, ready) in self.collect_ready() {
            let Some(channel) = self.shared.channel(id) else {
                continue;
            };
            if let Some(diagnostics) = self.diagnostics.as_mut() {
                diagnostics.observe_ops(id, ready, channel.interest());
            }
            if let Err(e) = self.dispatch(&channel, ready) {
                if e.is_channel_scoped() {
                    tracing::warn!(channel = %id, error = %e, "Channel operation failed");
                } else if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        self.process_closures(&selector);
        first_error.map_or(Ok(()), Err)
    }

    /// Make sure the loop polls the selector that is currently up.
    fn attach(&mut self) -> Option<Arc<Selector>> {
        let current = self.shared.current_selector();
        if let (Some(current), Some((_, attached))) = (&current, &self.poll) {
            if Arc::ptr_eq(current, attached) {
                return Some(current.clone());
            }
        }

        if self.poll.take().is_some() {
            tracing::debug!("Event loop detached from closed selector");
            self.buffers.clear();
            self.closures = Closures::default();
            if let Some(diagnostics) = self.diagnostics.as_mut() {
                *diagnostics = KeyStates::new();
            }
        }

        let wait = Duration::from_millis(self.shared.config.event_loop.bring_up_wait_ms);
        let (poll, selector) = self.shared.await_poll(wait)?;
        tracing::debug!("Event loop attached to selector");
        self.poll = Some((poll, selector.clone()));
        Some(selector)
    }

    /// Drop loop-local state of channels that left the table.
    fn prune(&mut self) {
        let channels = &self.shared.channels;
        self.buffers.retain(|id, _| channels.contains_key(id));
        self.closures.retain(|id| channels.contains_key(&id));
    }

    /// Re-read leftover bytes, request writes for staged bytes and give
    /// encrypted or backlogged connections a write pass.
    fn process_buffers(&mut self, channels: &[Arc<Channel>]) -> Result<()> {
        for channel in channels.iter().filter(|c| c.kind == ChannelKind::Stream) {
            let buffers = self.buffers.entry(channel.id).or_default();
            let result = service(&self.shared, channel, buffers, &mut self.closures);
            match result {
                Ok(()) => {}
                Err(e) if e.is_channel_scoped() => {
                    tracing::warn!(channel = %channel.id, error = %e, "Buffer processing failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn collect_ready(&self) -> Vec<(ChannelId, Ops)> {
        let mut ready: Vec<(ChannelId, Ops)> = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let mut ops = Ops::NONE;
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ops |= Ops::ACCEPT | Ops::READ;
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                ops |= Ops::CONNECT | Ops::WRITE;
            }
            let id = ChannelId::from(event.token());
            match ready.iter_mut().find(|(channel, _)| *channel == id) {
                Some((_, existing)) => *existing |= ops,
                None => ready.push((id, ops)),
            }
        }
        ready
    }

    fn dispatch(&mut self, channel: &Channel, ready: Ops) -> Result<()> {
        match channel.kind {
            ChannelKind::Listener => {
                if ready.contains(Ops::ACCEPT) {
                    self.shared.accept(channel)?;
                }
                Ok(())
            }
            ChannelKind::Stream => {
                if ready.contains(Ops::CONNECT) && channel.interest().contains(Ops::CONNECT) {
                    match self.shared.finish_connect(channel)? {
                        ConnectProgress::Connected | ConnectProgress::Pending => {}
                        ConnectProgress::Failed(e) => {
                            tracing::warn!(channel = %channel.id, error = %e, "Connect failed");
                            self.closures.mark(channel.id, true);
                        }
                    }
                }

                let buffers = self.buffers.entry(channel.id).or_default();
                let mut first_error = None;
                if ready.contains(Ops::READ) {
                    if let Err(e) = self.shared.read(channel, buffers, &mut self.closures) {
                        first_error = Some(e);
                    }
                }
                if ready.contains(Ops::WRITE) {
                    if let Err(e) = self.shared.write(channel, buffers, &mut self.closures) {
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Tear down every channel marked closed this iteration.
    fn process_closures(&mut self, selector: &Selector) {
        for channel in self.shared.snapshot() {
            if channel.teardown_requested() {
                self.closures.mark(channel.id, false);
            }
        }
        for (id, reset_by_peer) in self.closures.drain() {
            if let Some(channel) = self.shared.channel(id) {
                self.shared.close_channel(&channel, reset_by_peer, selector);
            }
            self.buffers.remove(&id);
            if let Some(diagnostics) = self.diagnostics.as_mut() {
                diagnostics.forget(id);
            }
        }
    }
}

fn service(
    shared: &Shared,
    channel: &Channel,
    buffers: &mut StreamBuffers,
    closures: &mut Closures,
) -> Result<()> {
    if buffers.has_unread() {
        shared.read(channel, buffers, closures)?;
    }
    let pending = buffers.has_unwritten() || channel.queue.lock().has_pending();
    if pending {
        shared.update_ops(channel, |ops| ops | Ops::WRITE)?;
    }
    // Engines may have handshake or closure records of their own to send.
    if pending || channel.is_encrypted() {
        shared.write(channel, buffers, closures)?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use mio::net::TcpStream;

    use super::*;
    use crate::config::NetworkConfig;
    use crate::error::Error;

    #[test]
    fn idle_plaintext_channels_are_left_alone() {
        // Without a selector any interest change fails, so reaching the
        // write path would surface as an error.
        let shared = Shared::new(NetworkConfig::default());
        let peer = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(peer.local_addr().unwrap()).unwrap();
        let channel = Channel::stream(ChannelId::next(), stream, None, true);
        let mut buffers = StreamBuffers::default();
        let mut closures = Closures::default();

        service(&shared, &channel, &mut buffers, &mut closures).unwrap();

        channel.queue.lock().buffer = Some({
            let mut pending = crate::net::NetBuffer::with_capacity(4);
            pending.put(b"data");
            pending
        });
        assert!(matches!(
            service(&shared, &channel, &mut buffers, &mut closures),
            Err(Error::NotUp)
        ));
        assert!(closures.is_empty());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = std::panic::catch_unwind(|| panic!("listener exploded")).unwrap_err();
        assert_eq!(panic_message(&*payload), "listener exploded");
    }
}
