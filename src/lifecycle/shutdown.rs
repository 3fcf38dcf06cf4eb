//! Shutdown coordination for the network thread.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Coordinator for stopping the event loop.
///
/// The loop checks the flag once per iteration; [`wait_timeout`](Self::wait_timeout)
/// lets it sleep in a way that [`trigger`](Self::trigger) cuts short.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the shutdown signal, waking any sleeper.
    pub fn trigger(&self) {
        *self.triggered.lock() = true;
        self.signal.notify_all();
    }

    /// Clear the signal so a new loop thread can run.
    pub fn reset(&self) {
        *self.triggered.lock() = false;
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Sleep for `duration` or until triggered. Returns true if triggered.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut triggered = self.triggered.lock();
        if !*triggered {
            self.signal.wait_for(&mut triggered, duration);
        }
        *triggered
    }
}
