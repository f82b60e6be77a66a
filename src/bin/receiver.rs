//! Audio Receiver Application
//!
//! Receives an Opus RTP stream, reorders it and decodes it with loss
//! concealment.
//!
//! Usage: `receiver [bind address] [config.toml]`

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_peer_audio::{
    codec::DecodingSink, config::StreamerConfig, constants::OPUS_CLOCK_RATE,
    network::ReceiveStream,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting media peer audio receiver");

    let mut args = std::env::args().skip(1);
    let bind: Option<SocketAddr> = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("Invalid bind address")?;
    let config_path = args.next().map(PathBuf::from);

    let mut config = StreamerConfig::load_or_default(config_path.as_deref())?;
    if let Some(bind) = bind {
        config.receive.bind = bind;
    }

    let (sink, decoded) = DecodingSink::new(
        OPUS_CLOCK_RATE,
        config.receive.channels,
        config.encoder.opus.fec,
        config.receive.sample_queue,
    )?;
    let undecodable = sink.undecodable_counter();

    let mut stream = ReceiveStream::bind(
        config.receive.bind,
        config.receive.read_timeout(),
        config.receive.reassembler(),
        Box::new(sink),
    )?;
    stream.start()?;

    // Playback is out of process; count what would be played
    let consumer = std::thread::Builder::new()
        .name("pcm-consumer".to_string())
        .spawn(move || {
            let (mut frames, mut concealed, mut samples) = (0u64, 0u64, 0u64);
            for audio in decoded.iter() {
                frames += 1;
                samples += audio.samples.len() as u64;
                if audio.concealed {
                    concealed += 1;
                }
            }
            (frames, concealed, samples)
        })?;

    tracing::info!("Receiving on {} - press Ctrl+C to stop", stream.local_addr());

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let stats = stream.stats();
                tracing::info!(
                    "Stats: {} datagrams ({} invalid), {} samples, {} lost, {} late, {} duplicates, {} undecodable",
                    stats.datagrams,
                    stats.invalid_packets,
                    stats.samples_delivered,
                    stats.reassembler.lost,
                    stats.reassembler.late,
                    stats.reassembler.duplicates,
                    undecodable.load(Ordering::Relaxed)
                );
                if stream.error().is_some() {
                    break;
                }
            }
        }
    }

    tracing::info!("Shutting down");
    let result = stream.stop();
    match consumer.join() {
        Ok((frames, concealed, samples)) => tracing::info!(
            "Decoded {} frames ({} concealed), {} samples",
            frames,
            concealed,
            samples
        ),
        Err(_) => tracing::warn!("PCM consumer panicked"),
    }
    result?;
    Ok(())
}
