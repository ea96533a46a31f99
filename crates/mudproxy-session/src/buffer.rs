//! Bounded replay buffer (C2, `spec.md` §4.2).

use std::collections::VecDeque;

use mudproxy_core::BufferedMessage;

/// Hard byte-size cap on a session's buffer, not configurable (§3).
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// FIFO queue of messages captured while a session's client is absent,
/// bounded by both a line count (`config.max_buffer_lines`) and the fixed
/// byte-size cap [`MAX_BUFFER_BYTES`].
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    entries: VecDeque<BufferedMessage>,
    byte_size: usize,
}

impl ReplayBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of `len(msg.data)` over all buffered entries.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Appends `data` under the eviction rules of §4.2, evaluated in order:
    /// drop chunks larger than [`MAX_BUFFER_BYTES`] outright; evict the
    /// oldest entry while at or over `max_lines`; evict the oldest entry
    /// while appending would exceed the byte cap; then append.
    ///
    /// Returns `false` if `data` was dropped for being individually too
    /// large; the caller should log a warning in that case (`BufferOverrun`,
    /// §7).
    pub fn append(&mut self, data: Vec<u8>, max_lines: usize) -> bool {
        if data.len() > MAX_BUFFER_BYTES {
            return false;
        }
        while self.entries.len() >= max_lines {
            self.evict_oldest();
        }
        while self.byte_size + data.len() > MAX_BUFFER_BYTES && !self.entries.is_empty() {
            self.evict_oldest();
        }
        self.byte_size += data.len();
        self.entries.push_back(BufferedMessage::new(data));
        true
    }

    fn evict_oldest(&mut self) {
        if let Some(evicted) = self.entries.pop_front() {
            self.byte_size -= evicted.len();
        }
    }

    /// Drains every entry in FIFO order and resets the buffer to empty.
    pub fn drain(&mut self) -> Vec<BufferedMessage> {
        self.byte_size = 0;
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_chunk_is_dropped_and_buffer_unchanged() {
        let mut buf = ReplayBuffer::new();
        let huge = vec![0u8; MAX_BUFFER_BYTES + 1];
        assert!(!buf.append(huge, 100));
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.byte_size(), 0);
    }

    #[test]
    fn scenario_5_fifo_eviction_by_line_count() {
        // spec.md §8 scenario 5: max_buffer_lines=3, four 1-byte chunks.
        let mut buf = ReplayBuffer::new();
        for b in [b'1', b'2', b'3', b'4'] {
            assert!(buf.append(vec![b], 3));
        }
        assert_eq!(buf.len(), 3);
        let drained = buf.drain();
        let bytes: Vec<u8> = drained.iter().map(|m| m.data[0]).collect();
        assert_eq!(bytes, vec![b'2', b'3', b'4']);
    }

    #[test]
    fn eviction_by_byte_size_keeps_total_under_cap() {
        let mut buf = ReplayBuffer::new();
        let chunk = vec![0u8; MAX_BUFFER_BYTES / 2 + 1];
        assert!(buf.append(chunk.clone(), 10_000));
        assert!(buf.append(chunk.clone(), 10_000));
        // second append evicted the first to stay under the byte cap
        assert_eq!(buf.len(), 1);
        assert!(buf.byte_size() <= MAX_BUFFER_BYTES);
    }

    #[test]
    fn drain_resets_buffer_to_empty() {
        let mut buf = ReplayBuffer::new();
        buf.append(b"a".to_vec(), 10);
        buf.append(b"b".to_vec(), 10);
        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert!(buf.is_empty());
        assert_eq!(buf.byte_size(), 0);
    }

    proptest::proptest! {
        // P1: buffer bounds always hold after any sequence of appends.
        #[test]
        fn p1_buffer_bounds_hold(
            chunks in proptest::collection::vec(proptest::collection::vec(0u8..=255u8, 0..2048), 0..64),
            max_lines in 10usize..=10_000,
        ) {
            let mut buf = ReplayBuffer::new();
            for chunk in chunks {
                buf.append(chunk, max_lines);
                proptest::prop_assert!(buf.byte_size() <= MAX_BUFFER_BYTES);
                proptest::prop_assert!(buf.len() <= max_lines);
            }
        }
    }
}
