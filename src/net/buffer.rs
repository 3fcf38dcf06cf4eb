//! Growable byte buffers for socket and crypto staging.
//!
//! # Responsibilities
//! - Hold bytes between a producer (socket, queue, engine) and a consumer
//! - Track a readable region and spare space without reallocating
//! - Grow by reallocation when a producer runs out of room
//!
//! # Design Decisions
//! - Capacity is fixed per allocation; growth goes through [`grow`], which
//!   consumes the old buffer and returns a new owned one
//! - Consumed bytes are reclaimed lazily by compacting before a fill

use std::io::{self, Read, Write};

/// A fixed-capacity byte buffer with a readable region and spare space.
///
/// ```text
/// 0        start        end          capacity
/// |consumed|  readable  |   spare    |
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct NetBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl NetBuffer {
    /// Create an empty buffer holding up to `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    /// Total number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when no more bytes fit, even after compaction.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Bytes that fit after compaction.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Offset of the first readable byte.
    pub fn position(&self) -> usize {
        self.start
    }

    /// Offset one past the last readable byte.
    pub fn limit(&self) -> usize {
        self.end
    }

    /// The readable bytes.
    pub fn chunk(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Mark `n` readable bytes as consumed.
    ///
    /// # Panics
    /// If `n` exceeds [`len`](Self::len).
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len(), "advance past readable region");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Drop all readable bytes.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Move the readable bytes to the front of the buffer.
    pub fn compact(&mut self) {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Spare space after the readable bytes, compacting first.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes written into [`spare_mut`](Self::spare_mut) as readable.
    ///
    /// # Panics
    /// If `n` exceeds the spare space.
    pub fn commit(&mut self, n: usize) {
        assert!(self.end + n <= self.capacity(), "commit past capacity");
        self.end += n;
    }

    /// Copy as much of `src` as fits, returning the number of bytes copied.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = spare.len().min(src.len());
        spare[..n].copy_from_slice(&src[..n]);
        self.commit(n);
        n
    }

    /// Let `fill` write into the spare space and commit what it reports.
    pub fn fill_with<E>(
        &mut self,
        fill: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        let n = fill(self.spare_mut())?;
        self.commit(n);
        Ok(n)
    }

    /// Read once from `reader` into the spare space.
    ///
    /// A full buffer reads nothing and returns `Ok(0)`, which is
    /// indistinguishable from end of stream; grow it first.
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.fill_with(|spare| reader.read(spare))
    }

    /// Write the readable bytes once to `writer`, consuming what it accepts.
    pub fn drain_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(self.chunk())?;
        self.advance(n);
        Ok(n)
    }
}

impl std::fmt::Debug for NetBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetBuffer")
            .field("position", &self.start)
            .field("limit", &self.end)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Reallocate `buffer` with `extra` more bytes of capacity.
///
/// The returned buffer replaces the old one: its readable bytes are the old
/// buffer's readable bytes, moved to the front.
pub fn grow(buffer: NetBuffer, extra: usize) -> NetBuffer {
    let mut grown = NetBuffer::with_capacity(buffer.capacity() + extra);
    grown.put(buffer.chunk());
    grown
}
