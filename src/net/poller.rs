//! Poll-style access to connection state changes.
//!
//! A [`StatePoller`] registers as both a server-state and a
//! connection-state listener and queues what it hears, so callers can
//! consume state changes from their own thread instead of reacting inside
//! callbacks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::net::channel::ChannelId;
use crate::net::network::Network;
use crate::net::notify::{ConnectionStateListener, ServerStateListener};

/// A state a connection can progress into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// A listener accepted the connection.
    Accepted,
    /// An outbound connection was established.
    Connected,
    /// The connection was torn down.
    Closed { reset_by_peer: bool },
}

/// Collects state changes per channel, in arrival order.
#[derive(Debug, Default)]
pub struct StatePoller {
    states: Mutex<VecDeque<(ChannelId, NetworkState)>>,
    arrived: Condvar,
}

impl StatePoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a poller already listening on `network`.
    pub fn attach(network: &Network) -> Arc<Self> {
        let poller = Arc::new(Self::new());
        network.register_server_state_listener(poller.clone());
        network.register_connection_state_listener(poller.clone());
        poller
    }

    fn offer(&self, channel: ChannelId, state: NetworkState) {
        self.states.lock().push_back((channel, state));
        self.arrived.notify_all();
    }

    /// Take the oldest pending state of `channel`.
    pub fn poll(&self, channel: ChannelId) -> Option<NetworkState> {
        take_for(&mut self.states.lock(), channel)
    }

    /// The channel with the oldest pending state, if any.
    pub fn poll_channel(&self) -> Option<ChannelId> {
        self.states.lock().front().map(|(channel, _)| *channel)
    }

    /// Like [`poll`](Self::poll), waiting up to `timeout` for a state to arrive.
    pub fn poll_timeout(&self, channel: ChannelId, timeout: Duration) -> Option<NetworkState> {
        let deadline = Instant::now() + timeout;
        let mut states = self.states.lock();
        loop {
            if let Some(state) = take_for(&mut states, channel) {
                return Some(state);
            }
            if self.arrived.wait_until(&mut states, deadline).timed_out() {
                return take_for(&mut states, channel);
            }
        }
    }

    /// Number of states not yet polled.
    pub fn pending(&self) -> usize {
        self.states.lock().len()
    }
}

fn take_for(
    states: &mut VecDeque<(ChannelId, NetworkState)>,
    channel: ChannelId,
) -> Option<NetworkState> {
    let index = states.iter().position(|(id, _)| *id == channel)?;
    states.remove(index).map(|(_, state)| state)
}

impl ServerStateListener for StatePoller {
    fn bound(&self, _listener: ChannelId) {}

    fn accepted(&self, _listener: ChannelId, connection: ChannelId) {
        self.offer(connection, NetworkState::Accepted);
    }
}

impl ConnectionStateListener for StatePoller {
    fn connected(&self, channel: ChannelId) {
        self.offer(channel, NetworkState::Connected);
    }

    fn closed(&self, channel: ChannelId, reset_by_peer: bool) {
        self.offer(channel, NetworkState::Closed { reset_by_peer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_fifo_per_channel() {
        let poller = StatePoller::new();
        let a = ChannelId::from_raw(1);
        let b = ChannelId::from_raw(2);

        poller.connected(a);
        poller.accepted(ChannelId::from_raw(9), b);
        poller.closed(a, true);

        assert_eq!(poller.poll_channel(), Some(a));
        assert_eq!(poller.poll(a), Some(NetworkState::Connected));
        assert_eq!(poller.poll_channel(), Some(b));
        assert_eq!(
            poller.poll(a),
            Some(NetworkState::Closed {
                reset_by_peer: true
            })
        );
        assert_eq!(poller.poll(a), None);
        assert_eq!(poller.poll(b), Some(NetworkState::Accepted));
        assert_eq!(poller.pending(), 0);
    }

    #[test]
    fn poll_timeout_sees_late_arrivals() {
        let poller = Arc::new(StatePoller::new());
        let channel = ChannelId::from_raw(5);
        let producer = {
            let poller = poller.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                poller.connected(channel);
            })
        };

        let state = poller.poll_timeout(channel, Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(state, Some(NetworkState::Connected));
    }

    #[test]
    fn poll_timeout_gives_up() {
        let poller = StatePoller::new();
        let state = poller.poll_timeout(ChannelId::from_raw(6), Duration::from_millis(10));
        assert_eq!(state, None);
    }
}
