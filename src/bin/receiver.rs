//! Audio Receiver Application
//!
//! Joins the network, answers discovery broadcasts and plays the Opus stream
//! of one transmitter at a time.

use anyhow::{Context, Result};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_receiver::{
    audio::{
        frame_queue, list_output_devices, CpalOutput, PlaybackEngine, PlaybackOptions,
        PlaybackSnapshot, PlaybackStats,
    },
    codec::{Codec, OpusCodec},
    config::ReceiverConfig,
    constants::*,
    fault::abort_on_fault,
    network::{
        discovery::DiscoverySnapshot, session::SessionSnapshot, AudioSessionServer,
        ConnectionState, ConnectivityManager, ConnectivityReader, Credentials, DiscoveryResponder,
        DiscoveryStats, HostLink, LinkLayer, SessionStats, StreamingFlag,
    },
    protocol::{DeviceDescriptor, HandshakeCapabilities},
};

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct StatusSnapshot {
    connection: ConnectionState,
    streaming: bool,
    playback: PlaybackSnapshot,
    session: SessionSnapshot,
    discovery: DiscoverySnapshot,
}

struct StatusSources {
    connectivity: ConnectivityReader,
    streaming: StreamingFlag,
    playback: Arc<PlaybackStats>,
    session: Arc<SessionStats>,
    discovery: Arc<DiscoveryStats>,
}

impl StatusSources {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connection: self.connectivity.state(),
            streaming: self.streaming.is_streaming(),
            playback: self.playback.snapshot(),
            session: self.session.snapshot(),
            discovery: self.discovery.snapshot(),
        }
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

    tracing::info!("Starting LAN Audio Receiver");

    let config = match std::env::args().nth(1).map(PathBuf::from).or_else(ReceiverConfig::default_path) {
        Some(path) => ReceiverConfig::load(&path)?,
        None => ReceiverConfig::default(),
    };
    config.validate().context("Invalid configuration")?;

    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        tracing::info!(
            "Output device {}{}: rates {:?}, channels {:?}",
            device.name,
            default_marker,
            device.sample_rates,
            device.channels
        );
    }

    let fault = abort_on_fault();
    let bind_ip: IpAddr = config
        .network
        .bind_address
        .parse()
        .context("Invalid bind address")?;

    // Link and connectivity
    let (link, link_events) = HostLink::new(config.mac_override()?);
    let mac_address = link.mac_address();
    let credentials = Credentials {
        ssid: config.network.ssid.clone(),
        psk: config.network.psk.clone(),
    };
    let manager = ConnectivityManager::new(link, credentials, &config.connectivity);
    let (connectivity, _connectivity_handle) = manager
        .spawn(link_events)
        .context("Failed to apply network credentials")?;

    // Identity
    let codec = OpusCodec;
    let descriptor = DeviceDescriptor::new(mac_address, &config.device.name, &codec.version());
    tracing::info!(
        "Receiver {:?} ({}), codec {}",
        descriptor.device_name,
        descriptor.mac_address,
        descriptor.codec_version
    );
    let capabilities = HandshakeCapabilities {
        descriptor: descriptor.clone(),
        max_encoded_frame_size: MAX_ENCODED_FRAME_SIZE as u32,
        max_decoded_frame_size: MAX_DECODED_FRAME_SIZE as u32,
    };

    // Playback
    let output = CpalOutput::new(
        config.playback.output_device.as_deref(),
        DECODE_CHANNELS,
        DECODE_SAMPLE_RATE,
        Duration::from_millis(config.playback.output_buffer_ms),
    )
    .context("Failed to open audio output")?;

    let (frames_tx, frames_rx) = frame_queue(config.playback.queue_capacity);
    let engine = PlaybackEngine::new(
        frames_rx,
        codec,
        output,
        PlaybackOptions {
            skip_undecodable_frames: config.playback.skip_undecodable_frames,
        },
        fault.clone(),
    );
    let playback_stats = engine.stats();
    engine.spawn()?;

    // Audio sessions
    let server = AudioSessionServer::bind(
        SocketAddr::new(bind_ip, config.network.audio_port),
        capabilities,
        frames_tx,
        connectivity.clone(),
    )?;
    let streaming = server.streaming_flag();
    let session_stats = server.stats();
    server.spawn()?;

    // Discovery
    let responder = DiscoveryResponder::new(
        SocketAddr::new(bind_ip, config.network.discovery_port),
        descriptor,
        streaming.clone(),
        connectivity.clone(),
        fault,
    );
    let discovery_stats = responder.stats();
    responder.spawn()?;

    let status = StatusSources {
        connectivity,
        streaming,
        playback: playback_stats,
        session: session_stats,
        discovery: discovery_stats,
    };

    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match serde_json::to_string(&status.snapshot()) {
                    Ok(json) => tracing::info!("Status: {}", json),
                    Err(e) => tracing::warn!("Failed to serialize status: {}", e),
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::warn!("Signal handler failed: {}", e);
                }
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
