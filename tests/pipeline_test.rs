//! Capture → encode → RTP/UDP → reassemble, over loopback

use media_peer_audio::audio::capture::{ActiveCapture, CaptureBackend, CaptureOptions, CaptureStream, ReadCallback};
use media_peer_audio::audio::format::{CaptureStreamConfig, SampleFormat};
use media_peer_audio::codec::{EncoderOptions, FrameDuration, FrameEncoder, OpusEncoder};
use media_peer_audio::config::OpusConfig;
use media_peer_audio::error::{AudioError, CodecError};
use media_peer_audio::lifecycle::StreamState;
use media_peer_audio::network::{ChannelSink, FrameSender, ReassemblerConfig, ReceiveStream};
use media_peer_audio::protocol::RtpPacketizer;
use std::thread;
use std::time::{Duration, Instant};

const TICKS: usize = 10;

/// Delivers one sine buffer per drain tick
struct SineBackend {
    buffers: usize,
    buffer_ms: u64,
}

struct SineActive {
    callback: ReadCallback,
    frames_per_buffer: usize,
    remaining: usize,
    phase: usize,
}

impl ActiveCapture for SineActive {
    fn flush_events(&mut self) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;

        let mut pcm = Vec::with_capacity(self.frames_per_buffer * 4);
        for _ in 0..self.frames_per_buffer {
            let t = self.phase as f32 / 48000.0;
            let value = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
            pcm.extend_from_slice(&value.to_ne_bytes());
            pcm.extend_from_slice(&value.to_ne_bytes());
            self.phase += 1;
        }
        self.callback.on_read(self.frames_per_buffer, Some(&pcm));
    }
}

impl CaptureBackend for SineBackend {
    fn open(
        self: Box<Self>,
        config: &CaptureStreamConfig,
        callback: ReadCallback,
    ) -> Result<Box<dyn ActiveCapture>, AudioError> {
        Ok(Box::new(SineActive {
            callback,
            frames_per_buffer: config.bytes_for(Duration::from_millis(self.buffer_ms)) / config.frame_bytes(),
            remaining: self.buffers,
            phase: 0,
        }))
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_capture_to_reassembled_samples() {
    let config = CaptureStreamConfig::new(SampleFormat::I16, 48000, 2);
    let options = CaptureOptions {
        buffer_duration: Duration::from_millis(20),
        headroom_buffers: 5,
        chunk_queue: 64,
    };

    // Receive side first so nothing sent is missed
    let (sink, samples) = ChannelSink::new(64);
    let mut receive = ReceiveStream::bind(
        "127.0.0.1:0".parse().unwrap(),
        Duration::from_millis(10),
        ReassemblerConfig::default(),
        Box::new(sink),
    )
    .unwrap();
    receive.start().unwrap();

    let backend = SineBackend {
        buffers: TICKS,
        buffer_ms: 20,
    };
    let mut capture = CaptureStream::new(Box::new(backend), config, options);
    let codec = OpusEncoder::new(48000, 2, &OpusConfig::default()).unwrap();
    let mut encoder = FrameEncoder::new(
        Box::new(codec),
        config,
        capture.chunks(),
        EncoderOptions {
            window: Some(FrameDuration::Ms20),
            ..EncoderOptions::default()
        },
    )
    .unwrap();
    let mut sender = FrameSender::new(
        receive.local_addr(),
        RtpPacketizer::new(0x5EED, 48000).with_initial_sequence(65530),
        encoder.frames(),
    )
    .unwrap();

    sender.start().unwrap();
    encoder.start().unwrap();
    capture.start().unwrap();

    // Stopping discards undelivered output, so let everything drain first
    wait_until(|| sender.stats().packets_sent >= TICKS as u64);
    capture.stop().unwrap();
    encoder.join().unwrap();
    sender.join().unwrap();

    assert_eq!(capture.stats().chunks_published, TICKS as u64);
    assert_eq!(capture.stats().overflows, 0);
    assert_eq!(encoder.stats().frames_encoded, TICKS as u64);
    assert_eq!(encoder.stats().violations, 0);
    assert_eq!(sender.stats().packets_sent, TICKS as u64);

    let received: Vec<_> = (0..TICKS)
        .map(|_| samples.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    receive.stop().unwrap();
    assert_eq!(receive.state(), StreamState::Stopped);
    assert!(samples.try_recv().is_err());

    let sequences: Vec<u16> = received.iter().map(|s| s.sequence).collect();
    let expected: Vec<u16> = (0..TICKS as u16).map(|i| 65530u16.wrapping_add(i)).collect();
    assert_eq!(sequences, expected);

    for pair in received.windows(2) {
        assert_eq!(pair[1].timestamp.wrapping_sub(pair[0].timestamp), 960);
        assert_eq!(pair[1].duration, Duration::from_millis(20));
    }
    assert!(received.iter().all(|s| s.prev_dropped_packets == 0 && !s.payload.is_empty()));
}

#[test]
fn test_encoder_abort_stops_capture() {
    let config = CaptureStreamConfig::new(SampleFormat::I16, 48000, 2);
    let options = CaptureOptions {
        buffer_duration: Duration::from_millis(20),
        headroom_buffers: 5,
        chunk_queue: 64,
    };

    // 13 ms is not a legal Opus window
    let backend = SineBackend {
        buffers: 100,
        buffer_ms: 13,
    };
    let mut capture = CaptureStream::new(Box::new(backend), config, options);
    let codec = OpusEncoder::new(48000, 2, &OpusConfig::default()).unwrap();
    let mut encoder = FrameEncoder::new(
        Box::new(codec),
        config,
        capture.chunks(),
        EncoderOptions {
            window: None,
            max_consecutive_violations: 3,
            ..EncoderOptions::default()
        },
    )
    .unwrap();

    encoder.start().unwrap();
    capture.start().unwrap();

    wait_until(|| capture.state() == StreamState::Stopped);
    assert_eq!(encoder.state(), StreamState::Stopped);
    assert_eq!(capture.state(), StreamState::Stopped);
    assert!(capture.stats().chunks_published < 100);

    assert_eq!(encoder.stop(), Err(CodecError::FramingAborted(3)));
    assert_eq!(encoder.stats().frames_encoded, 0);
    assert_eq!(capture.stop(), Ok(()));
}
