//! The engine handle and the state it shares with its event loop.
//!
//! # Responsibilities
//! - Own the channel table, the selector and the listener lists
//! - Start and stop the event loop thread
//! - Bring the selector up and down
//! - Expose bind, connect, queue, close and interest changes to any thread
//!
//! # Design Decisions
//! - [`Network`] is a cheap clone of an `Arc`; every clone drives the same engine
//! - The loop owns the `Poll`; callers only ever see the [`Selector`] side of it
//! - Bring-up hands a fresh `Poll` to the loop through a condvar-guarded slot

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mio::Poll;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::validation::validate_config;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::lifecycle::{LoopState, Shutdown};
use crate::net::channel::{Channel, ChannelId};
use crate::net::crypto::Encryption;
use crate::net::event_loop::EventLoop;
use crate::net::interest::{Ops, Selector};
use crate::net::notify::{ConnectionStateListener, DataListener, Listeners, ServerStateListener};
use crate::observability::metrics;

/// State shared between [`Network`] handles and the event loop thread.
pub(crate) struct Shared {
    pub(crate) config: NetworkConfig,
    pub(crate) channels: DashMap<ChannelId, Arc<Channel>>,
    /// `None` while the engine is down.
    selector: RwLock<Option<Arc<Selector>>>,
    /// A freshly opened poll waiting for the loop to pick it up.
    pending_poll: Mutex<Option<(Poll, Arc<Selector>)>>,
    poll_handoff: Condvar,
    pub(crate) listeners: Listeners,
    pub(crate) shutdown: Shutdown,
    pub(crate) state: Mutex<LoopState>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Serializes bring-up and bring-down.
    control: Mutex<()>,
}

impl Shared {
    pub(crate) fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            selector: RwLock::new(None),
            pending_poll: Mutex::new(None),
            poll_handoff: Condvar::new(),
            listeners: Listeners::new(),
            shutdown: Shutdown::new(),
            state: Mutex::new(LoopState::default()),
            thread: Mutex::new(None),
            control: Mutex::new(()),
        }
    }

    pub(crate) fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(&id).map(|entry| entry.value().clone())
    }

    /// Every channel currently in the table.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn selector(&self) -> Result<Arc<Selector>> {
        self.selector.read().clone().ok_or(Error::NotUp)
    }

    pub(crate) fn current_selector(&self) -> Option<Arc<Selector>> {
        self.selector.read().clone()
    }

    /// Wait up to `wait` for bring-up to hand over a poll.
    ///
    /// Returns early with `None` once shutdown has been triggered.
    pub(crate) fn await_poll(&self, wait: Duration) -> Option<(Poll, Arc<Selector>)> {
        let deadline = Instant::now() + wait;
        let mut pending = self.pending_poll.lock();
        loop {
            if let Some(handoff) = pending.take() {
                return Some(handoff);
            }
            if self.shutdown.is_triggered() {
                return None;
            }
            if self.poll_handoff.wait_until(&mut pending, deadline).timed_out() {
                return pending.take();
            }
        }
    }

    /// Change a channel's interest set to `f(current)`, masked to the
    /// operations valid for its kind.
    pub(crate) fn update_ops(
        &self,
        channel: &Channel,
        f: impl FnOnce(Ops) -> Ops,
    ) -> Result<()> {
        let selector = self.selector()?;
        let mut io = channel.io.lock();
        let current = io.interest;
        let wanted = f(current) & channel.kind.valid_ops();
        let Some(socket) = io.socket.as_mut() else {
            return Err(Error::ChannelClosed(channel.id));
        };
        if wanted == current {
            return Ok(());
        }

        selector.apply(socket, channel.id.token(), current, wanted)?;
        tracing::trace!(channel = %channel.id, from = %current, to = %wanted, "Interest changed");
        io.interest = wanted;
        Ok(())
    }

    /// Install `selector` without a loop thread to hand its poll to.
    #[cfg(test)]
    pub(crate) fn open_with(&self, selector: Arc<Selector>) {
        *self.selector.write() = Some(selector);
    }

    fn lookup(&self, id: ChannelId) -> Result<Arc<Channel>> {
        self.channel(id).ok_or(Error::UnknownChannel(id))
    }
}

/// Handle to a single-threaded, non-blocking network engine.
///
/// # Example
/// ```no_run
/// use netloop::{Network, NetworkConfig};
///
/// let network = Network::new(NetworkConfig::default())?;
/// network.bring_up()?;
/// let listener = network.bind("127.0.0.1:0".parse().unwrap(), None)?;
/// println!("listening on {}", network.local_addr(listener)?);
/// # Ok::<(), netloop::Error>(())
/// ```
#[derive(Clone)]
pub struct Network {
    shared: Arc<Shared>,
}

impl Network {
    /// Create a stopped engine. Fails if `config` does not validate.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        validate_config(&config).map_err(Error::InvalidConfig)?;
        Ok(Self {
            shared: Arc::new(Shared::new(config)),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    /// Spawn the event loop thread.
    pub fn start_thread(&self) -> Result<()> {
        let mut slot = self.shared.thread.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(Error::AlreadyRunning);
        }
        if let Some(finished) = slot.take() {
            let _ = finished.join();
        }

        self.shared.shutdown.reset();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("netloop".to_string())
            .spawn(move || EventLoop::new(shared).run())?;
        *slot = Some(handle);
        tracing::debug!("Network thread started");
        Ok(())
    }

    /// Bring the engine down, stop the loop and wait for its thread.
    ///
    /// Called from the loop thread itself (from a listener), the thread is
    /// told to stop but not joined.
    pub fn stop_thread(&self) {
        self.bring_down();
        self.shared.shutdown.trigger();
        {
            let _pending = self.shared.pending_poll.lock();
            self.shared.poll_handoff.notify_all();
        }

        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Network thread panicked");
            }
        }
        tracing::debug!("Network thread stopped");
    }

    pub fn is_thread_alive(&self) -> bool {
        self.shared
            .thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn loop_state(&self) -> LoopState {
        *self.shared.state.lock()
    }

    /// Open the selector, starting the loop thread first if needed.
    pub fn bring_up(&self) -> Result<()> {
        if !self.is_thread_alive() {
            match self.start_thread() {
                Ok(()) | Err(Error::AlreadyRunning) => {}
                Err(e) => return Err(e),
            }
        }

        let _control = self.shared.control.lock();
        if self.shared.selector.read().is_some() {
            return Ok(());
        }

        let poll = Poll::new()?;
        let selector = Arc::new(Selector::new(&poll)?);
        *self.shared.selector.write() = Some(selector.clone());
        {
            let mut pending = self.shared.pending_poll.lock();
            *pending = Some((poll, selector));
            self.shared.poll_handoff.notify_all();
        }
        tracing::info!("Networking engine up");
        Ok(())
    }

    /// Close the selector and tear every channel down on this thread.
    pub fn bring_down(&self) {
        let selector = {
            let _control = self.shared.control.lock();
            let Some(selector) = self.shared.selector.write().take() else {
                return;
            };
            self.shared.pending_poll.lock().take();
            selector
        };
        selector.wake();

        for channel in self.shared.snapshot() {
            self.shared.close_channel(&channel, false, &selector);
        }
        metrics::set_open_channels(self.shared.channels.len());
        tracing::info!("Networking engine down");
    }

    pub fn is_up(&self) -> bool {
        self.shared.selector.read().is_some()
    }

    /// Listen on `addr`. With `encryption`, every accepted connection gets
    /// its own server-mode engine.
    pub fn bind(&self, addr: SocketAddr, encryption: Option<Encryption>) -> Result<ChannelId> {
        self.shared.bind(addr, encryption)
    }

    /// Start connecting to `addr`. With `encryption`, the connection gets a
    /// client-mode engine.
    pub fn connect(&self, addr: SocketAddr, encryption: Option<Encryption>) -> Result<ChannelId> {
        self.shared.connect(addr, encryption)
    }

    /// Queue `data` for sending on `channel`.
    pub fn queue(&self, data: &[u8], channel: ChannelId) -> Result<()> {
        self.shared.queue(data, channel)
    }

    /// Close `channel` gracefully. Unknown and already closing channels are ignored.
    pub fn close(&self, channel: ChannelId) -> Result<()> {
        self.shared.close(channel)
    }

    pub fn add_ops(&self, channel: ChannelId, ops: Ops) -> Result<()> {
        let channel = self.shared.lookup(channel)?;
        self.shared.update_ops(&channel, |current| current | ops)
    }

    pub fn del_ops(&self, channel: ChannelId, ops: Ops) -> Result<()> {
        let channel = self.shared.lookup(channel)?;
        self.shared.update_ops(&channel, |current| current & !ops)
    }

    pub fn set_ops(&self, channel: ChannelId, ops: Ops) -> Result<()> {
        let channel = self.shared.lookup(channel)?;
        self.shared.update_ops(&channel, |_| ops)
    }

    /// The operations `channel` is registered for.
    pub fn interest(&self, channel: ChannelId) -> Result<Ops> {
        Ok(self.shared.lookup(channel)?.interest())
    }

    pub fn local_addr(&self, channel: ChannelId) -> Result<SocketAddr> {
        self.shared.lookup(channel)?.local_addr()
    }

    pub fn peer_addr(&self, channel: ChannelId) -> Result<SocketAddr> {
        self.shared.lookup(channel)?.peer_addr()
    }

    /// Number of listening and connected channels.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn register_server_state_listener(&self, listener: Arc<dyn ServerStateListener>) {
        self.shared.listeners.add_server(listener);
    }

    pub fn unregister_server_state_listener(
        &self,
        listener: &Arc<dyn ServerStateListener>,
    ) -> bool {
        self.shared.listeners.remove_server(listener)
    }

    pub fn register_connection_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.shared.listeners.add_connection(listener);
    }

    pub fn unregister_connection_state_listener(
        &self,
        listener: &Arc<dyn ConnectionStateListener>,
    ) -> bool {
        self.shared.listeners.remove_connection(listener)
    }

    pub fn register_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.shared.listeners.add_data(listener);
    }

    pub fn unregister_data_listener(&self, listener: &Arc<dyn DataListener>) -> bool {
        self.shared.listeners.remove_data(listener)
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("up", &self.is_up())
            .field("channels", &self.shared.channels.len())
            .field("state", &self.loop_state())
            .finish()
    }
}

/// Resolve `host` (`"name:port"`) to its first socket address.
pub fn resolve(host: &str) -> Result<SocketAddr> {
    host.to_socket_addrs()
        .map_err(|_| Error::Resolve(host.to_string()))?
        .next()
        .ok_or_else(|| Error::Resolve(host.to_string()))
}
