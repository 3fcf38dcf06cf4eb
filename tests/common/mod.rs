//! Shared utilities for loopback integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use netloop::{
    ChannelId, ConnectionStateListener, DataListener, Network, NetworkConfig,
    ServerStateListener,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Everything a recorder has heard, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Bound(ChannelId),
    Accepted { listener: ChannelId, connection: ChannelId },
    Connected(ChannelId),
    Closed { channel: ChannelId, reset_by_peer: bool },
}

/// Listener that records every notification and all received bytes.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    data: Mutex<HashMap<ChannelId, Vec<u8>>>,
}

impl Recorder {
    pub fn attach(network: &Network) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        network.register_server_state_listener(recorder.clone());
        network.register_connection_state_listener(recorder.clone());
        network.register_data_listener(recorder.clone());
        recorder
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn received(&self, channel: ChannelId) -> Vec<u8> {
        self.data.lock().get(&channel).cloned().unwrap_or_default()
    }

    /// Closed notifications seen for `channel`.
    pub fn closures(&self, channel: ChannelId) -> Vec<bool> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Closed {
                    channel: closed,
                    reset_by_peer,
                } if *closed == channel => Some(*reset_by_peer),
                _ => None,
            })
            .collect()
    }

    /// The first connection accepted by `listener`.
    pub fn wait_accepted(&self, listener: ChannelId) -> ChannelId {
        let mut accepted = None;
        wait_until("accept", || {
            accepted = self.events.lock().iter().find_map(|event| match event {
                Event::Accepted {
                    listener: l,
                    connection,
                } if *l == listener => Some(*connection),
                _ => None,
            });
            accepted.is_some()
        });
        accepted.unwrap()
    }

    pub fn wait_connected(&self, channel: ChannelId) {
        wait_until("connect", || {
            self.events.lock().contains(&Event::Connected(channel))
        });
    }

    pub fn wait_received(&self, channel: ChannelId, len: usize) -> Vec<u8> {
        wait_until("data", || self.received(channel).len() >= len);
        self.received(channel)
    }

    pub fn wait_closed(&self, channel: ChannelId) -> bool {
        wait_until("close", || !self.closures(channel).is_empty());
        self.closures(channel)[0]
    }
}

impl ServerStateListener for Recorder {
    fn bound(&self, listener: ChannelId) {
        self.events.lock().push(Event::Bound(listener));
    }

    fn accepted(&self, listener: ChannelId, connection: ChannelId) {
        self.events.lock().push(Event::Accepted {
            listener,
            connection,
        });
    }
}

impl ConnectionStateListener for Recorder {
    fn connected(&self, channel: ChannelId) {
        self.events.lock().push(Event::Connected(channel));
    }

    fn closed(&self, channel: ChannelId, reset_by_peer: bool) {
        self.events.lock().push(Event::Closed {
            channel,
            reset_by_peer,
        });
    }
}

impl DataListener for Recorder {
    fn received(&self, data: &[u8], channel: ChannelId) {
        self.data
            .lock()
            .entry(channel)
            .or_default()
            .extend_from_slice(data);
    }
}

/// Poll `condition` until it holds, panicking after [`WAIT`].
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Defaults with a short poll timeout.
pub fn test_config() -> NetworkConfig {
    let mut config = NetworkConfig::default();
    config.event_loop.poll_timeout_ms = 50;
    config
}

/// A running engine with a recorder attached.
pub fn start_engine() -> (Network, Arc<Recorder>) {
    start_engine_with(test_config())
}

pub fn start_engine_with(config: NetworkConfig) -> (Network, Arc<Recorder>) {
    let network = Network::new(config).unwrap();
    let recorder = Recorder::attach(&network);
    network.bring_up().unwrap();
    (network, recorder)
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Bind a plaintext listener on an ephemeral port and connect to it.
///
/// Returns (listener, client, server side of the connection).
pub fn plaintext_pair(
    network: &Network,
    recorder: &Recorder,
) -> (ChannelId, ChannelId, ChannelId) {
    let listener = network.bind(loopback(), None).unwrap();
    let addr = network.local_addr(listener).unwrap();
    let client = network.connect(addr, None).unwrap();
    recorder.wait_connected(client);
    let server = recorder.wait_accepted(listener);
    (listener, client, server)
}
