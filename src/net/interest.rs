//! Readiness interest sets and the selector registration surface.
//!
//! # Responsibilities
//! - Model the operations a channel wants to be told about ([`Ops`])
//! - Translate them to `mio` interests
//! - Serialize registration changes against the blocking poll ([`Selector`])
//!
//! # Design Decisions
//! - The selector wraps a cloned `mio::Registry`, so caller threads can
//!   register sockets while the loop thread owns the `Poll`
//! - Every registration change takes one guard and wakes the poll first

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use mio::event::Source;
use mio::{Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

/// Token reserved for the selector's waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// A set of channel operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    /// A listener has a connection to accept.
    pub const ACCEPT: Ops = Ops(0b0001);
    /// A pending outbound connection can be completed.
    pub const CONNECT: Ops = Ops(0b0010);
    /// A connection has bytes to read.
    pub const READ: Ops = Ops(0b0100);
    /// A connection can take more bytes.
    pub const WRITE: Ops = Ops(0b1000);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every op in `other` is in `self`.
    pub const fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any op in `other` is in `self`.
    pub const fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    /// The `mio` interest these ops need, `None` for the empty set.
    pub fn to_interest(self) -> Option<Interest> {
        let readable = self.intersects(Ops::ACCEPT | Ops::READ);
        let writable = self.intersects(Ops::CONNECT | Ops::WRITE);
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ops {
    type Output = Ops;

    fn bitand(self, rhs: Ops) -> Ops {
        Ops(self.0 & rhs.0)
    }
}

impl Not for Ops {
    type Output = Ops;

    fn not(self) -> Ops {
        Ops(!self.0 & 0b1111)
    }
}

impl fmt::Display for Ops {
    /// Renders as op initials, e.g. `RW` or `A`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (op, initial) in [
            (Ops::READ, 'R'),
            (Ops::WRITE, 'W'),
            (Ops::ACCEPT, 'A'),
            (Ops::CONNECT, 'C'),
        ] {
            if self.contains(op) {
                write!(f, "{initial}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ops({self})")
    }
}

/// The registration side of an open poll.
///
/// Dropping the last reference closes nothing by itself; the event loop
/// drops its `Poll` when the engine is brought down.
pub(crate) struct Selector {
    registry: Registry,
    waker: Waker,
    guard: Mutex<()>,
}

impl Selector {
    pub(crate) fn new(poll: &Poll) -> io::Result<Self> {
        Ok(Self {
            registry: poll.registry().try_clone()?,
            waker: Waker::new(poll.registry(), WAKE_TOKEN)?,
            guard: Mutex::new(()),
        })
    }

    /// Interrupt a blocked poll.
    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "Failed to wake selector");
        }
    }

    /// Move a source's registration from `current` to `wanted`.
    pub(crate) fn apply<S>(
        &self,
        source: &mut S,
        token: Token,
        current: Ops,
        wanted: Ops,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let _guard = self.guard.lock();
        self.wake();
        match (current.to_interest(), wanted.to_interest()) {
            (None, None) => Ok(()),
            (None, Some(interest)) => self.registry.register(source, token, interest),
            (Some(_), Some(interest)) => self.registry.reregister(source, token, interest),
            (Some(_), None) => self.registry.deregister(source),
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_set_algebra() {
        let ops = Ops::READ | Ops::WRITE;
        assert!(ops.contains(Ops::READ));
        assert!(!ops.contains(Ops::READ | Ops::ACCEPT));
        assert_eq!(ops & !Ops::WRITE, Ops::READ);
        assert!((ops & Ops::ACCEPT).is_empty());
    }

    #[test]
    fn ops_map_to_interest() {
        assert_eq!(Ops::ACCEPT.to_interest(), Some(Interest::READABLE));
        assert_eq!(Ops::CONNECT.to_interest(), Some(Interest::WRITABLE));
        assert_eq!(
            (Ops::READ | Ops::WRITE).to_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert_eq!(Ops::NONE.to_interest(), None);
    }

    #[test]
    fn ops_render_initials() {
        assert_eq!((Ops::WRITE | Ops::READ).to_string(), "RW");
        assert_eq!(Ops::ACCEPT.to_string(), "A");
        assert_eq!(Ops::NONE.to_string(), "");
    }

    #[test]
    fn selector_registers_and_deregisters() {
        let poll = Poll::new().unwrap();
        let selector = Selector::new(&poll).unwrap();
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut listener = mio::net::TcpListener::bind(addr).unwrap();

        selector
            .apply(&mut listener, Token(1), Ops::NONE, Ops::ACCEPT)
            .unwrap();
        selector
            .apply(&mut listener, Token(1), Ops::ACCEPT, Ops::ACCEPT)
            .unwrap();
        selector
            .apply(&mut listener, Token(1), Ops::ACCEPT, Ops::NONE)
            .unwrap();
    }
}
