//! Test Tone Transmitter
//!
//! Finds a receiver (or uses the address given on the command line) and
//! streams a 440 Hz tone to it in real time.

use anyhow::{bail, Context, Result};
use std::f32::consts::TAU;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_receiver::{
    codec::OpusEncoder,
    constants::*,
    network::{discover_receivers, RemoteReceiver},
};

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.25;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Stereo sine generator
struct ToneGenerator {
    phase: f32,
    step: f32,
}

impl ToneGenerator {
    fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate as f32,
        }
    }

    fn fill(&mut self, frame: &mut [i16], channels: usize) {
        for chunk in frame.chunks_exact_mut(channels) {
            let sample = (self.phase.sin() * TONE_AMPLITUDE * i16::MAX as f32) as i16;
            chunk.fill(sample);
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

async fn resolve_target() -> Result<SocketAddr> {
    if let Some(arg) = std::env::args().nth(1) {
        return arg.parse().context("Invalid receiver address");
    }

    tracing::info!("Searching for receivers on port {}", DISCOVERY_PORT);
    let receivers =
        tokio::task::spawn_blocking(|| discover_receivers(DISCOVERY_PORT, DISCOVERY_TIMEOUT)).await??;

    for receiver in &receivers {
        tracing::info!(
            "Found {:?} at {} (streaming: {})",
            receiver.info.device_name,
            receiver.address.ip(),
            receiver.info.currently_streaming
        );
    }

    match receivers.into_iter().find(|r| !r.info.currently_streaming) {
        Some(receiver) => Ok(SocketAddr::new(receiver.address.ip(), AUDIO_PORT)),
        None => bail!("No idle receiver found"),
    }
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

    tracing::info!("Starting LAN Audio Transmitter");

    let target = resolve_target().await?;
    let mut receiver = RemoteReceiver::connect(target)
        .with_context(|| format!("Failed to connect to {}", target))?;

    let mut encoder = OpusEncoder::music(DECODE_SAMPLE_RATE, DECODE_CHANNELS)?;
    let mut tone = ToneGenerator::new(TONE_HZ, DECODE_SAMPLE_RATE);
    let mut pcm = vec![0i16; encoder.samples_per_frame()];
    let frame_duration = Duration::from_secs_f32(encoder.frame_duration_ms() / 1000.0);

    tracing::info!(
        "Streaming {} Hz tone to {} in {:.0} ms frames",
        TONE_HZ,
        target,
        encoder.frame_duration_ms()
    );

    let mut interval = tokio::time::interval(frame_duration);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tone.fill(&mut pcm, DECODE_CHANNELS as usize);
                let frame = encoder.encode(&pcm)?;
                receiver.send_frame(frame)?;
                if receiver.frames_sent() % 500 == 0 {
                    tracing::info!("Sent {} frames", receiver.frames_sent());
                }
            }
            result = &mut shutdown => {
                result?;
                tracing::info!("Stopping after {} frames", receiver.frames_sent());
                break;
            }
        }
    }

    Ok(())
}
