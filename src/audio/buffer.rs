//! Fixed-capacity byte ring buffer between the hardware callback and the
//! drain loop
//!
//! One writer (the platform's callback thread) and one drainer (the capture
//! loop), each holding its own half of a lock-free `ringbuf` queue. Writes
//! never wait on the drainer and never grow the buffer; anything that does
//! not fit is dropped and counted.

use bytes::Bytes;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::format::CaptureStreamConfig;

/// Overflow accounting shared by both halves of a ring buffer
#[derive(Debug, Default)]
pub struct RingStats {
    overflow_count: AtomicU64,
    dropped_bytes: AtomicU64,
}

impl RingStats {
    fn record_overflow(&self, dropped: usize) {
        self.overflow_count.fetch_add(1, Ordering::Relaxed);
        self.dropped_bytes.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Number of write calls that had to drop data
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Total bytes dropped by overflowing writes
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes.load(Ordering::Relaxed)
    }
}

/// Byte ring buffer with overflow accounting
pub struct RingBuffer;

/// Write half, owned by the platform callback
pub struct RingProducer {
    producer: ringbuf::HeapProd<u8>,
    capacity: usize,
    stats: Arc<RingStats>,
}

/// Read half, owned by the drain loop
pub struct RingConsumer {
    consumer: ringbuf::HeapCons<u8>,
    capacity: usize,
    stats: Arc<RingStats>,
}

impl RingBuffer {
    /// Create a ring buffer holding at most `capacity` bytes
    ///
    /// Returns the (producer, consumer) pair.
    pub fn new(capacity: usize) -> (RingProducer, RingConsumer) {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
        let stats = Arc::new(RingStats::default());

        (
            RingProducer {
                producer,
                capacity,
                stats: stats.clone(),
            },
            RingConsumer {
                consumer,
                capacity,
                stats,
            },
        )
    }

    /// Size a buffer for `headroom` of audio in the given stream format
    pub fn for_stream(config: &CaptureStreamConfig, headroom: Duration) -> (RingProducer, RingConsumer) {
        Self::new(config.bytes_for(headroom).max(config.frame_bytes()))
    }
}

impl RingProducer {
    /// Append as much of `bytes` as fits; returns the number written
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.write_frames(bytes, 1)
    }

    /// Append the longest prefix of whole `frame_bytes`-sized frames that fits
    ///
    /// Counts one overflow event when anything had to be left out.
    pub fn write_frames(&mut self, bytes: &[u8], frame_bytes: usize) -> usize {
        let len = bytes.len().min(self.free_aligned(frame_bytes));
        let written = if len > 0 {
            self.producer.push_slice(&bytes[..len])
        } else {
            0
        };

        if written < bytes.len() {
            self.stats.record_overflow(bytes.len() - written);
        }
        written
    }

    /// Append `len` zero bytes, frame-aligned like `write_frames`
    pub fn write_silence(&mut self, len: usize, frame_bytes: usize) -> usize {
        let fits = len.min(self.free_aligned(frame_bytes));
        let written = self.producer.push_iter(std::iter::repeat(0u8).take(fits));

        if written < len {
            self.stats.record_overflow(len - written);
        }
        written
    }

    fn free_aligned(&self, frame_bytes: usize) -> usize {
        let free = self.producer.vacant_len();
        free - free % frame_bytes.max(1)
    }

    /// Bytes that can be written before overflowing
    pub fn free(&self) -> usize {
        self.producer.vacant_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &Arc<RingStats> {
        &self.stats
    }
}

impl RingConsumer {
    /// Remove and return everything currently readable
    pub fn drain_all(&mut self) -> Bytes {
        let len = self.consumer.occupied_len();
        if len == 0 {
            return Bytes::new();
        }

        let mut out = vec![0u8; len];
        let read = self.consumer.pop_slice(&mut out);
        out.truncate(read);
        Bytes::from(out)
    }

    /// Bytes waiting to be drained
    pub fn readable(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &Arc<RingStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_write_then_drain() {
        let (mut producer, mut consumer) = RingBuffer::new(8);

        assert_eq!(producer.write(&[1, 2, 3]), 3);
        assert_eq!(producer.write(&[4, 5]), 2);
        assert_eq!(consumer.readable(), 5);

        assert_eq!(&consumer.drain_all()[..], &[1, 2, 3, 4, 5]);
        assert_eq!(consumer.readable(), 0);
        assert!(consumer.drain_all().is_empty());
    }

    #[test]
    fn test_wraps_around_capacity() {
        let (mut producer, mut consumer) = RingBuffer::new(4);
        producer.write(&[1, 2, 3]);
        consumer.drain_all();

        assert_eq!(producer.write(&[4, 5, 6, 7]), 4);
        assert_eq!(&consumer.drain_all()[..], &[4, 5, 6, 7]);
    }

    #[test]
    fn test_overflow_keeps_prefix_and_counts_once() {
        let (mut producer, mut consumer) = RingBuffer::new(6);
        producer.write(&[9, 9]);

        assert_eq!(producer.write(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(producer.stats().overflow_count(), 1);
        assert_eq!(consumer.stats().dropped_bytes(), 2);
        assert_eq!(&consumer.drain_all()[..], &[9, 9, 1, 2, 3, 4]);
    }

    #[test]
    fn test_full_buffer_rejects_everything() {
        let (mut producer, mut consumer) = RingBuffer::new(2);
        producer.write(&[1, 2]);

        assert_eq!(producer.write(&[3]), 0);
        assert_eq!(producer.stats().overflow_count(), 1);
        assert_eq!(&consumer.drain_all()[..], &[1, 2]);
    }

    #[test]
    fn test_write_frames_never_splits_a_frame() {
        let (mut producer, consumer) = RingBuffer::new(10);

        // 3 frames of 4 bytes offered, only 2 fit
        assert_eq!(producer.write_frames(&[7u8; 12], 4), 8);
        assert_eq!(consumer.readable(), 8);
        assert_eq!(producer.stats().overflow_count(), 1);
        assert_eq!(producer.stats().dropped_bytes(), 4);
    }

    #[test]
    fn test_silence_is_zeroed() {
        let (mut producer, mut consumer) = RingBuffer::new(8);
        producer.write(&[5, 5, 5, 5, 5, 5]);
        consumer.drain_all();

        assert_eq!(producer.write_silence(4, 2), 4);
        assert_eq!(&consumer.drain_all()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_silence_overflow_is_frame_aligned() {
        let (mut producer, mut consumer) = RingBuffer::new(7);

        assert_eq!(producer.write_silence(12, 4), 4);
        assert_eq!(producer.stats().dropped_bytes(), 8);
        assert_eq!(consumer.drain_all().len(), 4);
    }

    #[test]
    fn test_for_stream_holds_at_least_one_frame() {
        let config = CaptureStreamConfig::new(crate::audio::format::SampleFormat::F32, 48000, 2);
        let (producer, consumer) = RingBuffer::for_stream(&config, Duration::ZERO);
        assert_eq!(producer.capacity(), 8);
        assert_eq!(consumer.capacity(), 8);
    }

    #[test]
    fn test_concurrent_writer_and_drainer() {
        let (mut producer, mut consumer) = RingBuffer::new(1024);
        let stats = producer.stats().clone();
        let writer = std::thread::spawn(move || {
            let mut written = 0usize;
            for i in 0..2000u32 {
                let byte = (i % 251) as u8;
                written += producer.write(&[byte]);
            }
            written
        });

        let mut drained = Vec::new();
        while !writer.is_finished() {
            drained.extend_from_slice(&consumer.drain_all());
        }
        let written = writer.join().unwrap();
        drained.extend_from_slice(&consumer.drain_all());

        assert_eq!(drained.len(), written);
        assert_eq!(
            written as u64 + stats.dropped_bytes(),
            2000,
            "every byte is either delivered or counted"
        );
    }

    proptest! {
        #[test]
        fn prop_drain_returns_concatenation(
            writes in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..16)
        ) {
            let total: usize = writes.iter().map(Vec::len).sum();
            let (mut producer, mut consumer) = RingBuffer::new(total.max(1));
            for w in &writes {
                prop_assert_eq!(producer.write(w), w.len());
            }

            let expected: Vec<u8> = writes.concat();
            prop_assert_eq!(&consumer.drain_all()[..], &expected[..]);
            prop_assert_eq!(consumer.readable(), 0);
            prop_assert_eq!(consumer.stats().overflow_count(), 0);
        }

        #[test]
        fn prop_overflow_writes_free_space(
            capacity in 1usize..64,
            prefill in 0usize..64,
            extra in 1usize..64,
        ) {
            let (mut producer, consumer) = RingBuffer::new(capacity);
            let prefill = prefill.min(capacity);
            producer.write(&vec![1u8; prefill]);
            let free = capacity - prefill;

            let written = producer.write(&vec![2u8; free + extra]);
            prop_assert_eq!(written, free);
            prop_assert_eq!(producer.stats().overflow_count(), 1);
            prop_assert_eq!(consumer.readable(), capacity);
        }
    }
}
