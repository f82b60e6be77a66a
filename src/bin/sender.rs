//! Audio Sender Application
//!
//! Captures one device and streams it as Opus over RTP/UDP.
//!
//! Usage: `sender [destination] [config.toml]`

use anyhow::{Context, Result};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_peer_audio::{
    audio::{CaptureStream, CpalCatalog, DeviceCatalog},
    codec::{FrameEncoder, OpusEncoder},
    config::StreamerConfig,
    network::FrameSender,
    protocol::RtpPacketizer,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

fn random_u32() -> u32 {
    RandomState::new().build_hasher().finish() as u32
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting media peer audio sender");

    let mut args = std::env::args().skip(1);
    let destination: Option<SocketAddr> = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("Invalid destination address")?;
    let config_path = args.next().map(PathBuf::from);

    let mut config = StreamerConfig::load_or_default(config_path.as_deref())?;
    if let Some(destination) = destination {
        config.send.destination = destination;
    }

    let catalog = CpalCatalog::new();
    println!("\n=== Available Audio Devices ===");
    for device in catalog.devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    ID: {}", device.id);
    }
    println!();

    let device_id = match &config.capture.device {
        Some(id) => id.clone(),
        None => catalog.default_input_device()?.id,
    };

    let mut capture = CaptureStream::open(&catalog, &device_id, config.capture.options())?;
    let stream_config = *capture.config();

    let codec = OpusEncoder::new(
        stream_config.sample_rate,
        stream_config.channels,
        &config.encoder.opus,
    )
    .context("Negotiated capture format is not encodable as Opus")?;
    let mut encoder = FrameEncoder::new(
        Box::new(codec),
        stream_config,
        capture.chunks(),
        config.encoder.options()?,
    )?;

    let packetizer = RtpPacketizer::new(
        config.send.ssrc.unwrap_or_else(random_u32),
        stream_config.sample_rate,
    )
    .with_payload_type(config.send.payload_type)
    .with_initial_sequence(random_u32() as u16)
    .with_timestamp_base(random_u32());
    tracing::info!("Streaming with SSRC {:08x}", packetizer.ssrc());
    let mut sender = FrameSender::new(config.send.destination, packetizer, encoder.frames())?;

    sender.start()?;
    encoder.start()?;
    capture.start()?;
    tracing::info!("Capturing {} - press Ctrl+C to stop", device_id);

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let capture_stats = capture.stats();
                let encoder_stats = encoder.stats();
                let send_stats = sender.stats();
                tracing::info!(
                    "Stats: {} chunks, {} overflows, {} frames encoded (avg {:.0} bytes), {} packets sent, {:.1} KB sent",
                    capture_stats.chunks_published,
                    capture_stats.overflows,
                    encoder_stats.frames_encoded,
                    encoder_stats.average_frame_size,
                    send_stats.packets_sent,
                    send_stats.bytes_sent as f64 / 1024.0
                );
                if capture.error().is_some() || encoder.error().is_some() || sender.error().is_some() {
                    break;
                }
            }
        }
    }

    tracing::info!("Shutting down");
    // Upstream first so each stage drains into a live consumer
    let capture_result = capture.stop();
    let encoder_result = encoder.join();
    let sender_result = sender.join();
    capture_result?;
    encoder_result?;
    sender_result?;
    Ok(())
}
