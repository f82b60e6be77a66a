//! RTP wire format (RFC 3550)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |                   CSRC list (CC entries)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::frame_encoder::EncodedFrame;
use crate::constants::{OPUS_CLOCK_RATE, OPUS_PAYLOAD_TYPE};
use crate::error::NetworkError;

/// Fixed header size
pub const RTP_HEADER_SIZE: usize = 12;

const RTP_VERSION: u8 = 2;

/// One RTP packet; only the fields the pipeline uses are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl NetworkPacket {
    /// Parse a datagram. CSRCs and header extensions are skipped, padding
    /// is stripped.
    pub fn decode(mut data: Bytes) -> Result<Self, NetworkError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(NetworkError::InvalidPacket("shorter than RTP header"));
        }

        let first = data.get_u8();
        if first >> 6 != RTP_VERSION {
            return Err(NetworkError::InvalidPacket("unsupported RTP version"));
        }
        let has_padding = first & 0x20 != 0;
        let has_extension = first & 0x10 != 0;
        let csrc_count = (first & 0x0F) as usize;

        let second = data.get_u8();
        let marker = second & 0x80 != 0;
        let payload_type = second & 0x7F;
        let sequence = data.get_u16();
        let timestamp = data.get_u32();
        let ssrc = data.get_u32();

        if data.len() < csrc_count * 4 {
            return Err(NetworkError::InvalidPacket("truncated CSRC list"));
        }
        data.advance(csrc_count * 4);

        if has_extension {
            if data.len() < 4 {
                return Err(NetworkError::InvalidPacket("truncated header extension"));
            }
            let _profile = data.get_u16();
            let words = data.get_u16() as usize;
            if data.len() < words * 4 {
                return Err(NetworkError::InvalidPacket("truncated header extension"));
            }
            data.advance(words * 4);
        }

        if has_padding {
            let padding = match data.last() {
                Some(&n) if n > 0 && n as usize <= data.len() => n as usize,
                _ => return Err(NetworkError::InvalidPacket("invalid padding")),
            };
            data.truncate(data.len() - padding);
        }

        Ok(Self {
            payload_type,
            marker,
            sequence,
            timestamp,
            ssrc,
            payload: data,
        })
    }

    /// Serialize without CSRCs, extension or padding
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        RTP_HEADER_SIZE + self.payload.len()
    }
}

/// Turns encoded frames into RTP packets of one stream
#[derive(Debug)]
pub struct RtpPacketizer {
    ssrc: u32,
    payload_type: u8,
    clock_rate: u32,
    sample_rate: u32,
    sequence: u16,
    /// Offset added to every timestamp; zero unless set with
    /// `with_timestamp_base`
    timestamp_base: u32,
    first: bool,
}

impl RtpPacketizer {
    /// `sample_rate` is the rate frame timestamps are counted in
    pub fn new(ssrc: u32, sample_rate: u32) -> Self {
        Self {
            ssrc,
            payload_type: OPUS_PAYLOAD_TYPE,
            clock_rate: OPUS_CLOCK_RATE,
            sample_rate: sample_rate.max(1),
            sequence: 0,
            timestamp_base: 0,
            first: true,
        }
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type & 0x7F;
        self
    }

    pub fn with_initial_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_timestamp_base(mut self, base: u32) -> Self {
        self.timestamp_base = base;
        self
    }

    /// The RTP timestamp of a frame starting `samples` into the session
    pub fn rtp_timestamp(&self, samples: u64) -> u32 {
        let ticks = (samples as u128 * self.clock_rate as u128 / self.sample_rate as u128) as u64;
        self.timestamp_base.wrapping_add(ticks as u32)
    }

    pub fn packetize(&mut self, frame: &EncodedFrame) -> NetworkPacket {
        let packet = NetworkPacket {
            payload_type: self.payload_type,
            marker: self.first,
            sequence: self.sequence,
            timestamp: self.rtp_timestamp(frame.timestamp),
            ssrc: self.ssrc,
            payload: frame.data.clone(),
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.first = false;
        packet
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }
}
