//! Listener traits and notification fan-out.
//!
//! # Design Decisions
//! - One trait per listener category, one or two methods each
//! - Fan-out iterates a snapshot in registration order, synchronously on
//!   the notifying thread, with no locks held so listeners may call back
//!   into the engine
//! - No error isolation: a panicking listener unwinds into the event loop

use std::sync::Arc;

use parking_lot::RwLock;

use crate::net::channel::ChannelId;

/// Observes listening sockets.
pub trait ServerStateListener: Send + Sync {
    /// A listening channel was bound.
    fn bound(&self, listener: ChannelId);

    /// `listener` accepted a new connection, `connection`.
    fn accepted(&self, listener: ChannelId, connection: ChannelId);
}

/// Observes connection sockets.
pub trait ConnectionStateListener: Send + Sync {
    /// An outbound connection was established.
    fn connected(&self, channel: ChannelId);

    /// A connection was torn down. `reset_by_peer` is true when the remote
    /// side closed it and false when the local side hung up.
    fn closed(&self, channel: ChannelId, reset_by_peer: bool);
}

/// Receives decrypted application data.
pub trait DataListener: Send + Sync {
    /// `data` arrived on `channel`. The slice is only valid for the call.
    fn received(&self, data: &[u8], channel: ChannelId);
}

struct ListenerList<L: ?Sized>(RwLock<Vec<Arc<L>>>);

impl<L: ?Sized> ListenerList<L> {
    fn new() -> Self {
        Self(RwLock::new(Vec::new()))
    }

    fn add(&self, listener: Arc<L>) {
        self.0.write().push(listener);
    }

    fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.0.write();
        let before = listeners.len();
        listeners.retain(|registered| !same_listener(registered, listener));
        listeners.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        self.0.read().clone()
    }

    fn len(&self) -> usize {
        self.0.read().len()
    }
}

/// Compares data pointers only; vtable pointers for one type may differ
/// between codegen units.
fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// The three listener lists of one engine.
pub(crate) struct Listeners {
    server: ListenerList<dyn ServerStateListener>,
    connection: ListenerList<dyn ConnectionStateListener>,
    data: ListenerList<dyn DataListener>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            server: ListenerList::new(),
            connection: ListenerList::new(),
            data: ListenerList::new(),
        }
    }

    pub(crate) fn add_server(&self, listener: Arc<dyn ServerStateListener>) {
        self.server.add(listener);
        tracing::debug!(count = self.server.len(), "Server state listener registered");
    }

    pub(crate) fn remove_server(&self, listener: &Arc<dyn ServerStateListener>) -> bool {
        self.server.remove(listener)
    }

    pub(crate) fn add_connection(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.connection.add(listener);
        tracing::debug!(count = self.connection.len(), "Connection state listener registered");
    }

    pub(crate) fn remove_connection(&self, listener: &Arc<dyn ConnectionStateListener>) -> bool {
        self.connection.remove(listener)
    }

    pub(crate) fn add_data(&self, listener: Arc<dyn DataListener>) {
        self.data.add(listener);
        tracing::debug!(count = self.data.len(), "Data listener registered");
    }

    pub(crate) fn remove_data(&self, listener: &Arc<dyn DataListener>) -> bool {
        self.data.remove(listener)
    }

    pub(crate) fn bound(&self, listener: ChannelId) {
        for l in self.server.snapshot() {
            l.bound(listener);
        }
    }

    pub(crate) fn accepted(&self, listener: ChannelId, connection: ChannelId) {
        for l in self.server.snapshot() {
            l.accepted(listener, connection);
        }
    }

    pub(crate) fn connected(&self, channel: ChannelId) {
        for l in self.connection.snapshot() {
            l.connected(channel);
        }
    }

    pub(crate) fn closed(&self, channel: ChannelId, reset_by_peer: bool) {
        for l in self.connection.snapshot() {
            l.closed(channel, reset_by_peer);
        }
    }

    pub(crate) fn received(&self, data: &[u8], channel: ChannelId) {
        for l in self.data.snapshot() {
            l.received(data, channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Tagged {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl DataListener for Tagged {
        fn received(&self, data: &[u8], channel: ChannelId) {
            self.log.lock().push(format!(
                "{}:{}:{}",
                self.tag,
                channel,
                String::from_utf8_lossy(data)
            ));
        }
    }

    #[test]
    fn fan_out_follows_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::new();
        for tag in ["a", "b", "c"] {
            listeners.add_data(Arc::new(Tagged {
                tag,
                log: log.clone(),
            }));
        }

        listeners.received(b"hi", ChannelId::from_raw(3));
        assert_eq!(*log.lock(), vec!["a:ch-3:hi", "b:ch-3:hi", "c:ch-3:hi"]);
    }

    #[test]
    fn unregister_removes_only_that_listener() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::new();
        let first: Arc<dyn DataListener> = Arc::new(Tagged {
            tag: "first",
            log: log.clone(),
        });
        let second: Arc<dyn DataListener> = Arc::new(Tagged {
            tag: "second",
            log: log.clone(),
        });
        listeners.add_data(first.clone());
        listeners.add_data(second);

        assert!(listeners.remove_data(&first));
        assert!(!listeners.remove_data(&first));

        listeners.received(b"x", ChannelId::from_raw(1));
        assert_eq!(*log.lock(), vec!["second:ch-1:x"]);
    }
}
