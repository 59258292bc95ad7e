//! Audio output device
//!
//! [`AudioOutput`] is the narrow interface the playback engine drives.
//! [`CpalOutput`] implements it on a cpal output stream: the engine writes
//! PCM into a bounded sample ring and the stream callback drains it, much
//! like a DMA ring feeding a DAC.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::find_output_device;
use crate::error::AudioError;

/// Output device as seen by the playback engine
pub trait AudioOutput: Send {
    /// Programs the device clock. Called before the first `start`.
    fn configure(&mut self, sample_rate: u32) -> Result<(), AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    /// Submits interleaved little-endian 16 bit PCM. Blocks until at least
    /// part of it fits and returns the number of bytes accepted.
    fn write(&mut self, pcm: &[u8]) -> Result<usize, AudioError>;

    /// Time the device needs to drain one of its buffers
    fn service_interval(&self) -> Duration;
}

/// Samples between the engine and the stream callback
struct SampleRing {
    samples: Mutex<RingState>,
    space: Condvar,
    capacity: usize,
}

struct RingState {
    queue: VecDeque<i16>,
    error: Option<String>,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(RingState {
                queue: VecDeque::with_capacity(capacity),
                error: None,
            }),
            space: Condvar::new(),
            capacity,
        }
    }

    /// Queues as much of `pcm` as fits, waiting in steps of `wait` while
    /// the ring is full. Returns the bytes accepted.
    fn write(&self, pcm: &[u8], wait: Duration) -> Result<usize, AudioError> {
        let mut state = self.samples.lock();
        loop {
            if let Some(err) = state.error.take() {
                return Err(AudioError::StreamError(err));
            }
            if state.queue.len() < self.capacity {
                break;
            }
            self.space.wait_for(&mut state, wait);
        }

        let free = self.capacity - state.queue.len();
        let accepted = free.min(pcm.len() / 2);
        state.queue.extend(
            pcm[..accepted * 2]
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );
        Ok(accepted * 2)
    }

    /// Fills `out` from the ring. Never blocks: if the writer holds the
    /// lock this period plays silence.
    fn render(&self, out: &mut [f32]) {
        let Some(mut state) = self.samples.try_lock() else {
            out.fill(0.0);
            return;
        };
        for sample in out.iter_mut() {
            // silence while the ring is empty
            *sample = state
                .queue
                .pop_front()
                .map(|s| f32::from(s) / 32768.0)
                .unwrap_or(0.0);
        }
        drop(state);
        self.space.notify_one();
    }

    /// Drops queued samples so a restart begins with fresh audio
    fn clear(&self) {
        self.samples.lock().queue.clear();
        self.space.notify_all();
    }

    fn fail(&self, error: String) {
        self.samples.lock().error = Some(error);
        self.space.notify_all();
    }
}

enum Command {
    Configure(u32, Sender<Result<(), AudioError>>),
    Start(Sender<Result<(), AudioError>>),
    Stop(Sender<Result<(), AudioError>>),
}

/// cpal-backed output
pub struct CpalOutput {
    ring: Arc<SampleRing>,
    commands: Option<Sender<Command>>,
    thread_handle: Option<JoinHandle<()>>,
    service_interval: Duration,
}

impl CpalOutput {
    /// Opens `device_name` (or the default device) for `channels` channels.
    /// The ring holds two service intervals of audio at `max_sample_rate`.
    pub fn new(
        device_name: Option<&str>,
        channels: u16,
        max_sample_rate: u32,
        service_interval: Duration,
    ) -> Result<Self, AudioError> {
        let device = find_output_device(device_name)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let period_samples =
            (max_sample_rate as u128 * service_interval.as_micros() / 1_000_000) as usize;
        let capacity = (period_samples * channels as usize * 2).max(channels as usize);
        let ring = Arc::new(SampleRing::new(capacity));

        let (command_tx, command_rx) = bounded::<Command>(4);
        let ring_for_thread = ring.clone();

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let mut stream: Option<cpal::Stream> = None;

                for command in command_rx {
                    match command {
                        Command::Configure(sample_rate, reply) => {
                            // at most one open stream per device
                            stream = None;
                            let result = match build_stream(&device, channels, sample_rate, ring_for_thread.clone()) {
                                Ok(s) => {
                                    stream = Some(s);
                                    Ok(())
                                }
                                Err(e) => Err(e),
                            };
                            let _ = reply.send(result);
                        }
                        Command::Start(reply) => {
                            let result = match stream.as_ref() {
                                Some(s) => s.play().map_err(|e| AudioError::CpalError(e.to_string())),
                                None => Err(AudioError::NotConfigured),
                            };
                            let _ = reply.send(result);
                        }
                        Command::Stop(reply) => {
                            let result = match stream.as_ref() {
                                Some(s) => s.pause().map_err(|e| AudioError::CpalError(e.to_string())),
                                None => Err(AudioError::NotConfigured),
                            };
                            let _ = reply.send(result);
                        }
                    }
                }
                // Stream is dropped here, stopping output
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        tracing::info!("Audio output opened on {} ({} samples buffered)", name, capacity);

        Ok(Self {
            ring,
            commands: Some(command_tx),
            thread_handle: Some(handle),
            service_interval,
        })
    }

    fn request(&self, make: impl FnOnce(Sender<Result<(), AudioError>>) -> Command) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .as_ref()
            .ok_or(AudioError::OutputClosed)?
            .send(make(reply_tx))
            .map_err(|_| AudioError::OutputClosed)?;
        reply_rx.recv().map_err(|_| AudioError::OutputClosed)?
    }
}

fn build_stream(
    device: &cpal::Device,
    channels: u16,
    sample_rate: u32,
    ring: Arc<SampleRing>,
) -> Result<cpal::Stream, AudioError> {
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let ring_for_errors = ring.clone();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| ring.render(data),
            move |err| {
                tracing::error!("Output stream error: {}", err);
                ring_for_errors.fail(err.to_string());
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    // cpal may start streams eagerly; playback starts on request only
    stream
        .pause()
        .map_err(|e| AudioError::CpalError(e.to_string()))?;
    Ok(stream)
}

impl AudioOutput for CpalOutput {
    fn configure(&mut self, sample_rate: u32) -> Result<(), AudioError> {
        self.request(|reply| Command::Configure(sample_rate, reply))?;
        tracing::info!("Audio output configured for {} Hz", sample_rate);
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.request(Command::Start)
    }

    /// Pauses the stream and discards what it had not played yet.
    fn stop(&mut self) -> Result<(), AudioError> {
        self.request(Command::Stop)?;
        self.ring.clear();
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize, AudioError> {
        if pcm.len() < 2 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} bytes is not a whole sample",
                pcm.len()
            )));
        }

        self.ring.write(pcm, self.service_interval)
    }

    fn service_interval(&self) -> Duration {
        self.service_interval
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        // closing the command channel ends the output thread
        self.commands = None;
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}
