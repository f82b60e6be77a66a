//! Jitter reassembler
//!
//! Reorders RTP packets by sequence number and releases them as samples
//! once they are contiguous, or once a gap has been outstanding for
//! `reorder_depth` sequence numbers. Output depends only on the order
//! packets were pushed in.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_REASSEMBLER_CAPACITY, DEFAULT_REORDER_DEPTH, OPUS_CLOCK_RATE};
use crate::protocol::NetworkPacket;

/// Reassembler tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReassemblerConfig {
    /// Sequence numbers a gap may stay open before it is abandoned
    pub reorder_depth: u16,
    /// Buffered packets before the oldest is evicted
    pub capacity: usize,
    /// RTP clock rate of the timestamps
    pub clock_rate: u32,
    /// Duration reported for the first sample, which has no predecessor
    pub nominal_duration: Duration,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            reorder_depth: DEFAULT_REORDER_DEPTH,
            capacity: DEFAULT_REASSEMBLER_CAPACITY,
            clock_rate: OPUS_CLOCK_RATE,
            nominal_duration: Duration::from_millis(20),
        }
    }
}

/// One reconstructed media sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledSample {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
    pub duration: Duration,
    /// Packets abandoned right before this one
    pub prev_dropped_packets: u16,
}

/// Reassembler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub received: u64,
    pub duplicates: u64,
    pub late: u64,
    pub lost: u64,
    pub evicted: u64,
    pub timestamp_regressions: u64,
    pub emitted: u64,
}

struct Buffered {
    timestamp: u32,
    payload: Bytes,
}

pub struct JitterReassembler {
    config: ReassemblerConfig,
    packets: BTreeMap<u64, Buffered>,
    /// Extended sequence number expected next; `None` until the first emit
    next_seq: Option<u64>,
    /// Highest extended sequence number seen
    highest: Option<u64>,
    last_timestamp: Option<u32>,
    /// Packets skipped since the last emitted sample
    pending_loss: u64,
    stats: ReassemblerStats,
}

impl JitterReassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config: ReassemblerConfig {
                capacity: config.capacity.max(1),
                clock_rate: config.clock_rate.max(1),
                ..config
            },
            packets: BTreeMap::new(),
            next_seq: None,
            highest: None,
            last_timestamp: None,
            pending_loss: 0,
            stats: ReassemblerStats::default(),
        }
    }

    /// Map a 16-bit sequence number onto the extended counter, picking the
    /// candidate closest to the highest number seen so far
    fn extend(&self, sequence: u16) -> u64 {
        let reference = match self.highest {
            Some(highest) => highest,
            None => return (1u64 << 16) + sequence as u64,
        };

        let delta = sequence.wrapping_sub(reference as u16) as i16 as i64;
        let extended = reference as i64 + delta;
        extended.max(0) as u64
    }

    pub fn push(&mut self, packet: NetworkPacket) {
        self.stats.received += 1;
        let ext = self.extend(packet.sequence);

        if let Some(next) = self.next_seq {
            if ext < next {
                self.stats.late += 1;
                debug!("Late packet {} dropped", packet.sequence);
                return;
            }
        }
        if self.packets.contains_key(&ext) {
            self.stats.duplicates += 1;
            debug!("Duplicate packet {} dropped", packet.sequence);
            return;
        }

        self.packets.insert(
            ext,
            Buffered {
                timestamp: packet.timestamp,
                payload: packet.payload,
            },
        );
        self.highest = Some(self.highest.map_or(ext, |h| h.max(ext)));

        while self.packets.len() > self.config.capacity {
            if let Some((seq, _)) = self.packets.pop_first() {
                self.stats.evicted += 1;
                self.skip_to(seq + 1);
                warn!("Reassembler full, evicted packet {}", seq as u16);
            }
        }
    }

    /// Move the emission point forward to `seq`, counting what was skipped
    fn skip_to(&mut self, seq: u64) {
        match self.next_seq {
            Some(next) if seq > next => {
                let skipped = seq - next;
                self.pending_loss += skipped;
                self.stats.lost += skipped;
                self.next_seq = Some(seq);
            }
            None => self.next_seq = Some(seq),
            _ => {}
        }
    }

    /// Next in-order sample, if one can be released yet
    pub fn pop(&mut self) -> Option<ReassembledSample> {
        loop {
            let (&ext, _) = self.packets.first_key_value()?;
            let highest = self.highest.unwrap_or(ext);
            let depth = self.config.reorder_depth as u64;

            let ready = match self.next_seq {
                Some(next) if ext == next => true,
                // Waiting for the start of the stream to settle
                None => highest - ext >= depth,
                Some(next) => {
                    let expired = highest.saturating_sub(next) >= depth;
                    if expired {
                        debug!(
                            "Abandoning gap of {} packets before {}",
                            ext - next,
                            ext as u16
                        );
                        self.skip_to(ext);
                    }
                    expired
                }
            };
            if !ready {
                return None;
            }

            if let Some(sample) = self.release(ext) {
                return Some(sample);
            }
        }
    }

    /// Release every buffered packet in order, abandoning all gaps
    pub fn flush(&mut self) -> Vec<ReassembledSample> {
        let mut samples = Vec::with_capacity(self.packets.len());
        while let Some((&ext, _)) = self.packets.first_key_value() {
            if self.next_seq.is_some() {
                self.skip_to(ext);
            }
            if let Some(sample) = self.release(ext) {
                samples.push(sample);
            }
        }
        samples
    }

    /// Take `ext` out of the buffer; `None` when its timestamp would run
    /// backwards
    fn release(&mut self, ext: u64) -> Option<ReassembledSample> {
        let packet = self.packets.remove(&ext)?;
        self.next_seq = Some(ext + 1);

        let duration = match self.last_timestamp {
            Some(last) => {
                let delta = packet.timestamp.wrapping_sub(last) as i32;
                if delta < 0 {
                    self.stats.timestamp_regressions += 1;
                    warn!(
                        "Packet {} regresses timestamp {} -> {}, dropped",
                        ext as u16, last, packet.timestamp
                    );
                    return None;
                }
                Duration::from_nanos(delta as u64 * 1_000_000_000 / self.config.clock_rate as u64)
            }
            None => self.config.nominal_duration,
        };
        self.last_timestamp = Some(packet.timestamp);

        let prev_dropped_packets = self.pending_loss.min(u16::MAX as u64) as u16;
        self.pending_loss = 0;
        self.stats.emitted += 1;

        Some(ReassembledSample {
            sequence: ext as u16,
            timestamp: packet.timestamp,
            payload: packet.payload,
            duration,
            prev_dropped_packets,
        })
    }

    pub fn buffered(&self) -> usize {
        self.packets.len()
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats.clone()
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packet(sequence: u16) -> NetworkPacket {
        NetworkPacket {
            payload_type: 111,
            marker: false,
            sequence,
            timestamp: sequence as u32 * 960,
            ssrc: 1,
            payload: Bytes::from(vec![sequence as u8]),
        }
    }

    fn reassembler(depth: u16) -> JitterReassembler {
        JitterReassembler::new(ReassemblerConfig {
            reorder_depth: depth,
            ..ReassemblerConfig::default()
        })
    }

    fn drain(r: &mut JitterReassembler) -> Vec<u16> {
        std::iter::from_fn(|| r.pop()).map(|s| s.sequence).collect()
    }

    #[test]
    fn test_gap_is_abandoned_after_depth() {
        let mut r = reassembler(2);
        let mut out = Vec::new();
        for seq in [1, 2, 3, 5] {
            r.push(packet(seq));
            out.extend(drain(&mut r));
        }
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(r.buffered(), 1);

        // 4 has now been outstanding for two sequence numbers
        r.push(packet(6));
        let samples: Vec<_> = std::iter::from_fn(|| r.pop()).collect();
        assert_eq!(
            samples.iter().map(|s| s.sequence).collect::<Vec<_>>(),
            vec![5, 6]
        );
        assert_eq!(samples[0].prev_dropped_packets, 1);
        assert_eq!(samples[1].prev_dropped_packets, 0);
        assert_eq!(r.stats().lost, 1);
    }

    #[test]
    fn test_reorder_within_depth() {
        let mut r = reassembler(2);
        let mut out = Vec::new();
        for seq in [3, 1, 2] {
            r.push(packet(seq));
            out.extend(drain(&mut r));
        }
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(r.stats().lost, 0);
    }

    #[test]
    fn test_flush_releases_held_packets() {
        let mut r = reassembler(3);
        for seq in [3, 1, 2] {
            r.push(packet(seq));
        }
        assert!(r.pop().is_none());
        let out: Vec<_> = r.flush().into_iter().map(|s| s.sequence).collect();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_duplicates_and_late_packets_are_counted() {
        let mut r = reassembler(1);
        r.push(packet(10));
        r.push(packet(10));
        r.push(packet(11));
        assert_eq!(drain(&mut r), vec![10, 11]);

        r.push(packet(10));
        r.push(packet(9));
        assert!(r.pop().is_none());

        let stats = r.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.late, 2);
        assert_eq!(stats.emitted, 2);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut r = reassembler(1);
        let mut out = Vec::new();
        for seq in [65534, 65535, 0, 1] {
            r.push(packet(seq));
            out.extend(drain(&mut r));
        }
        out.extend(r.flush().into_iter().map(|s| s.sequence));
        assert_eq!(out, vec![65534, 65535, 0, 1]);
        assert_eq!(r.stats().lost, 0);
    }

    #[test]
    fn test_timestamp_regression_is_dropped() {
        let mut r = reassembler(0);
        r.push(packet(1));
        let mut bad = packet(2);
        bad.timestamp = 0;
        r.push(bad);
        r.push(packet(3));

        assert_eq!(drain(&mut r), vec![1, 3]);
        assert_eq!(r.stats().timestamp_regressions, 1);
    }

    #[test]
    fn test_durations_follow_timestamps() {
        let mut r = reassembler(0);
        r.push(packet(1));
        r.push(packet(2));
        let mut third = packet(3);
        third.timestamp = 2 * 960 + 480;
        r.push(third);

        let durations: Vec<_> = std::iter::from_fn(|| r.pop()).map(|s| s.duration).collect();
        assert_eq!(
            durations,
            vec![
                Duration::from_millis(20),
                Duration::from_millis(20),
                Duration::from_millis(10)
            ]
        );
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut r = JitterReassembler::new(ReassemblerConfig {
            reorder_depth: 100,
            capacity: 3,
            ..ReassemblerConfig::default()
        });
        for seq in [1, 2, 3, 4] {
            r.push(packet(seq));
        }
        assert_eq!(r.buffered(), 3);
        assert_eq!(r.stats().evicted, 1);

        // 1 is gone; late arrivals below the eviction point are refused
        r.push(packet(1));
        assert_eq!(r.stats().late, 1);
        assert_eq!(drain(&mut r), vec![2, 3, 4]);
    }

    proptest! {
        #[test]
        fn prop_output_is_ordered_and_unique(
            seqs in proptest::collection::vec(0u16..64, 0..120),
            depth in 0u16..6,
        ) {
            let run = |seqs: &[u16]| {
                let mut r = reassembler(depth);
                let mut out = Vec::new();
                for &seq in seqs {
                    r.push(packet(seq + 100));
                    out.extend(std::iter::from_fn(|| r.pop()).map(|s| (s.sequence, s.timestamp)));
                }
                out.extend(r.flush().into_iter().map(|s| (s.sequence, s.timestamp)));
                out
            };

            let out = run(&seqs);
            prop_assert_eq!(&out, &run(&seqs));
            for pair in out.windows(2) {
                prop_assert!(pair[0].0 < pair[1].0);
                prop_assert!(pair[0].1 <= pair[1].1);
            }
        }
    }
}
