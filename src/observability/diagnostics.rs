//! Per-channel key state diagnostics.
//!
//! When enabled, the event loop remembers the last ready set, interest set
//! and handshake status it saw for every channel and logs a line whenever
//! one of them changes. State is owned by the loop and dropped with the
//! channel.

use std::collections::HashMap;
use std::fmt;

use crate::net::buffer::NetBuffer;
use crate::net::channel::ChannelId;
use crate::net::crypto::HandshakeStatus;
use crate::net::interest::Ops;

const GAUGE_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyState {
    ready: Ops,
    interest: Ops,
    handshake: Option<HandshakeStatus>,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            ready: Ops::NONE,
            interest: Ops::NONE,
            handshake: None,
        }
    }
}

/// Last observed key state per channel.
#[derive(Debug, Default)]
pub struct KeyStates {
    states: HashMap<ChannelId, KeyState>,
}

impl KeyStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ready and interest sets seen for `channel` this iteration.
    pub fn observe_ops(&mut self, channel: ChannelId, ready: Ops, interest: Ops) -> bool {
        let state = self.states.entry(channel).or_default();
        if state.ready == ready && state.interest == interest {
            return false;
        }
        tracing::debug!(
            channel = %channel,
            ready = %ready,
            interest = %interest,
            previous_ready = %state.ready,
            previous_interest = %state.interest,
            "Key state changed"
        );
        state.ready = ready;
        state.interest = interest;
        true
    }

    /// Record the handshake status reported by `channel`'s engine.
    pub fn observe_handshake(&mut self, channel: ChannelId, status: HandshakeStatus) -> bool {
        let state = self.states.entry(channel).or_default();
        if state.handshake == Some(status) {
            return false;
        }
        tracing::debug!(channel = %channel, status = %status, "Handshake status changed");
        state.handshake = Some(status);
        true
    }

    pub fn forget(&mut self, channel: ChannelId) {
        self.states.remove(&channel);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Render a buffer as a fill gauge: consumed bytes as `|`, readable bytes
/// as `-`, spare space blank, then `position/limit` and `|capacity` when
/// the limit is short of it.
pub fn render_buffer(buffer: &NetBuffer) -> String {
    BufferGauge(buffer).to_string()
}

/// Display adapter for [`render_buffer`], usable directly in log fields.
pub struct BufferGauge<'a>(pub &'a NetBuffer);

impl fmt::Display for BufferGauge<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.0;
        let capacity = buffer.capacity();
        let width = capacity.min(GAUGE_WIDTH);
        let scale = |n: usize| if capacity == 0 { 0 } else { n * width / capacity };
        let consumed = scale(buffer.position());
        let filled = scale(buffer.limit()).max(consumed);

        f.write_str("[")?;
        for i in 0..width {
            let c = if i < consumed {
                '|'
            } else if i < filled {
                '-'
            } else {
                ' '
            };
            write!(f, "{c}")?;
        }
        write!(f, "] {}/{}", buffer.position(), buffer.limit())?;
        if buffer.limit() != capacity {
            write!(f, "|{capacity}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_shows_consumed_and_readable() {
        let mut buffer = NetBuffer::with_capacity(10);
        buffer.put(b"abcdefg");
        buffer.advance(3);
        assert_eq!(render_buffer(&buffer), "[|||----   ] 3/7|10");
    }

    #[test]
    fn full_buffer_omits_capacity() {
        let mut buffer = NetBuffer::with_capacity(4);
        buffer.put(b"abcd");
        assert_eq!(render_buffer(&buffer), "[----] 0/4");
    }

    #[test]
    fn wide_buffers_are_scaled() {
        let mut buffer = NetBuffer::with_capacity(100);
        buffer.put(&[0u8; 50]);
        let rendered = render_buffer(&buffer);
        assert!(rendered.starts_with("[----------          ]"));
        assert!(rendered.ends_with(" 0/50|100"));
    }

    #[test]
    fn changes_are_reported_once() {
        let mut states = KeyStates::new();
        let channel = ChannelId::from_raw(1);
        assert!(states.observe_ops(channel, Ops::READ, Ops::READ | Ops::WRITE));
        assert!(!states.observe_ops(channel, Ops::READ, Ops::READ | Ops::WRITE));
        assert!(states.observe_handshake(channel, HandshakeStatus::NeedWrap));
        assert!(!states.observe_handshake(channel, HandshakeStatus::NeedWrap));

        states.forget(channel);
        assert!(states.is_empty());
    }
}
