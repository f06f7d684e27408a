//! Bounded byte queue for stream sockets.
//!
//! Reconciles host delivery chunking with guest-requested read sizes: the
//! loop thread pushes whatever a readiness event delivered, and a guest
//! receive pops exactly what it asked for once enough has accumulated.

use std::collections::VecDeque;

/// Capacity of a stream session's accumulator.
pub(crate) const STREAM_BUFFER_CAPACITY: usize = 0x80000;

/// A bounded FIFO of bytes. `push` never drops data silently: it reports
/// how much it accepted, and the session pauses host delivery while the
/// queue is full so the unaccepted tail stays in the kernel buffer.
#[derive(Debug)]
pub struct StreamAccumulator {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl StreamAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Remaining room before `push` starts refusing bytes.
    pub fn free(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Appends as much of `bytes` as fits; returns the accepted count.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.free());
        self.buf.extend(&bytes[..take]);
        take
    }

    /// Removes and returns the first `n` bytes (clamped to the current
    /// length).
    pub fn pop(&mut self, n: usize) -> Vec<u8> {
        let take = n.min(self.buf.len());
        self.buf.drain(..take).collect()
    }
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new(STREAM_BUFFER_CAPACITY)
    }
}
