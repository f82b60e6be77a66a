use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use media_peer_audio::audio::buffer::RingBuffer;
use media_peer_audio::audio::format::{CaptureStreamConfig, SampleFormat};

fn bench_write_drain(c: &mut Criterion) {
    let config = CaptureStreamConfig::new(SampleFormat::F32, 48000, 2);
    let mut group = c.benchmark_group("ring_buffer");

    for ms in [5u64, 10, 20] {
        let bytes = config.bytes_for(Duration::from_millis(ms));
        let pcm = vec![0x5Au8; bytes];
        let (mut producer, mut consumer) = RingBuffer::for_stream(&config, Duration::from_millis(100));

        group.throughput(Throughput::Bytes(bytes as u64));
        group.bench_with_input(BenchmarkId::new("write_frames", ms), &pcm, |b, pcm| {
            b.iter(|| {
                producer.write_frames(black_box(pcm), config.frame_bytes());
                black_box(consumer.drain_all());
            })
        });
    }

    group.bench_function("write_silence_20ms", |b| {
        let (mut producer, mut consumer) = RingBuffer::for_stream(&config, Duration::from_millis(100));
        let len = config.bytes_for(Duration::from_millis(20));
        b.iter(|| {
            producer.write_silence(black_box(len), config.frame_bytes());
            black_box(consumer.drain_all());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_write_drain);
criterion_main!(benches);
