//! Audio session server
//!
//! Accepts one transmitter at a time over TCP. Each session starts with the
//! capabilities handshake, queues a stream-start marker for the playback
//! engine and then forwards every audio frame it reads into the frame queue. `accept`
//! is only called again once the current session has ended, so a second
//! transmitter waits in the listen backlog.

use serde::Serialize;
use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{EncodedFrame, FrameSender};
use crate::error::{NetworkError, ProtocolError};
use crate::network::connectivity::ConnectivityReader;
use crate::protocol::{
    read_delimited, to_receiver, write_delimited, Delimited, HandshakeCapabilities, ToReceiver,
};

/// Pause after a failed `accept` before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Whether a transmitter is currently connected
#[derive(Clone, Default)]
pub struct StreamingFlag(Arc<AtomicBool>);

impl StreamingFlag {
    pub fn is_streaming(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, streaming: bool) {
        self.0.store(streaming, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    sessions: AtomicU64,
    frames_accepted: AtomicU64,
    frames_rejected: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub sessions: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Peer closed the socket, possibly mid-message
    PeerClosed,
    /// A message without a known payload
    UnknownMessage,
    /// Socket error or a broken length prefix
    Framing(ProtocolError),
    /// The frame queue has no consumer left
    PlaybackStopped,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::UnknownMessage => write!(f, "message of unknown type"),
            Self::Framing(e) => write!(f, "{}", e),
            Self::PlaybackStopped => write!(f, "playback stopped"),
        }
    }
}

impl From<ProtocolError> for SessionEnd {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Disconnected => Self::PeerClosed,
            other => Self::Framing(other),
        }
    }
}

/// TCP server feeding the frame queue; its only producer
pub struct AudioSessionServer {
    listener: TcpListener,
    capabilities: HandshakeCapabilities,
    frames: FrameSender,
    streaming: StreamingFlag,
    connectivity: ConnectivityReader,
    stats: Arc<SessionStats>,
}

impl AudioSessionServer {
    pub fn bind(
        addr: SocketAddr,
        capabilities: HandshakeCapabilities,
        frames: FrameSender,
        connectivity: ConnectivityReader,
    ) -> Result<Self, NetworkError> {
        let listener =
            TcpListener::bind(addr).map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        tracing::info!("Audio session server listening on {}", addr);

        Ok(Self {
            listener,
            capabilities,
            frames,
            streaming: StreamingFlag::default(),
            connectivity,
            stats: Arc::new(SessionStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn streaming_flag(&self) -> StreamingFlag {
        self.streaming.clone()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Serves sessions one after another while connected. Returns only when
    /// playback has gone away.
    pub fn run(&self) {
        loop {
            self.connectivity.wait_connected();

            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_RETRY_DELAY);
                    continue;
                }
            };

            tracing::info!("Transmitter connected from {}", peer);
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Could not disable Nagle on {}: {}", peer, e);
            }

            let end = self.serve_session(&mut stream);
            tracing::info!("Session with {} ended: {}", peer, end);

            if matches!(end, SessionEnd::PlaybackStopped) {
                return;
            }
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("audio-session".to_string())
            .spawn(move || self.run())
    }

    /// Runs one session to completion on an accepted stream.
    pub fn serve_session<S: Read + Write>(&self, stream: &mut S) -> SessionEnd {
        let handshake = self.capabilities.to_message(self.streaming.is_streaming());
        if let Err(e) = write_delimited(stream, &handshake) {
            return e.into();
        }

        // frames of the previous session still queued keep their decoder
        if self.frames.start_stream().is_err() {
            return SessionEnd::PlaybackStopped;
        }
        self.streaming.set(true);
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);

        let end = self.receive_frames(stream);
        self.streaming.set(false);
        end
    }

    fn receive_frames<S: Read>(&self, stream: &mut S) -> SessionEnd {
        let max_frame = self.capabilities.max_encoded_frame_size as usize;
        let max_message = self.capabilities.max_message_len();

        loop {
            let message = match read_delimited::<ToReceiver, _>(stream, max_message) {
                Ok(message) => message,
                Err(e) => return e.into(),
            };

            let data = match message {
                Delimited::Message(ToReceiver {
                    message: Some(to_receiver::Message::AudioData(data)),
                }) => data,
                Delimited::Message(ToReceiver { message: None }) => {
                    return SessionEnd::UnknownMessage;
                }
                Delimited::Oversized(len) => {
                    self.reject(format_args!("message of {} bytes exceeds {}", len, max_message));
                    continue;
                }
                Delimited::Malformed(e) => {
                    self.reject(format_args!("undecodable message: {}", e));
                    continue;
                }
            };

            let frame = data.opus_encoded_frame;
            if frame.len() > max_frame {
                self.reject(format_args!("frame of {} bytes exceeds {}", frame.len(), max_frame));
                continue;
            }

            if self.frames.push(EncodedFrame::new(frame)).is_err() {
                return SessionEnd::PlaybackStopped;
            }
            self.stats.frames_accepted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reject(&self, reason: fmt::Arguments<'_>) {
        self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Rejected message: {}", reason);
    }
}
