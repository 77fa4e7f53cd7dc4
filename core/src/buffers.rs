//! Bounded byte and chunk buffers shared by the session pipeline.

use std::collections::VecDeque;

/// Rolling byte tail with high/low watermarks. Appends are unbounded until
/// the buffer exceeds `high`, at which point the front is trimmed back to
/// `low` so trims stay amortized instead of firing on every write.
#[derive(Debug)]
pub(crate) struct RollingTail {
    buf: Vec<u8>,
    high: usize,
    low: usize,
}

impl RollingTail {
    pub(crate) fn new(high: usize, low: usize) -> Self {
        debug_assert!(low <= high);
        Self {
            buf: Vec::new(),
            high,
            low,
        }
    }

    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.high {
            let excess = self.buf.len() - self.low;
            self.buf.drain(..excess);
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// FIFO queue of input chunks accepted before a session reaches readiness.
/// Overflow drops the oldest chunk and counts it, so late input (most likely
/// still relevant to the user) survives a flood.
#[derive(Debug)]
pub(crate) struct PendingInputQueue {
    chunks: VecDeque<Vec<u8>>,
    max_chunks: usize,
    dropped: u64,
}

impl PendingInputQueue {
    pub(crate) fn new(max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            max_chunks,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: Vec<u8>) {
        if self.chunks.len() == self.max_chunks {
            self.chunks.pop_front();
            self.dropped += 1;
        }
        self.chunks.push_back(chunk);
    }

    /// Removes and returns all queued chunks in arrival order.
    pub(crate) fn drain(&mut self) -> Vec<Vec<u8>> {
        self.chunks.drain(..).collect()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tail_trims_front_to_low_watermark() {
        let mut tail = RollingTail::new(10, 4);
        tail.extend(b"0123456789");
        assert_eq!(tail.as_bytes().len(), 10);
        tail.extend(b"ab");
        // 12 bytes exceeded high=10, trimmed back to low=4.
        assert_eq!(tail.as_bytes(), b"89ab");
    }

    #[test]
    fn tail_survives_chunk_larger_than_high() {
        let mut tail = RollingTail::new(8, 4);
        tail.extend(b"0123456789abcdef");
        assert_eq!(tail.as_bytes(), b"cdef");
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let mut q = PendingInputQueue::new(2);
        q.push(b"one".to_vec());
        q.push(b"two".to_vec());
        q.push(b"three".to_vec());
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.drain(), vec![b"two".to_vec(), b"three".to_vec()]);
        assert!(q.drain().is_empty());
    }
}
