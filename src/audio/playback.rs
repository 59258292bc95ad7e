//! Playback engine
//!
//! The real-time path: pop a compressed frame, decode it into the scratch
//! buffer, hand the PCM to the output device. While playing, the pop waits
//! only as long as the device can go without new data (its service interval
//! minus the recent decode time). Missing that deadline is an underflow: the
//! device is stopped and the engine waits without a deadline until the
//! transmitter sends again.
//!
//! A stream-start marker in the queue discards the decoder, so the first
//! frame of every session is decoded from a clean state.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{EncodedFrame, FrameReceiver, PlaybackBuffer, Pop};
use crate::audio::output::AudioOutput;
use crate::codec::{Codec, FrameCodec};
use crate::constants::*;
use crate::error::AudioError;
use crate::fault::SharedFaultHandler;

/// Resolution of the output timer decode durations are measured in
pub const OUTPUT_TICK: Duration = Duration::from_millis(1);

/// Underflows between two log lines
const UNDERFLOW_LOG_INTERVAL: u64 = 100;

/// Number of ticks covering `duration`, rounded up
pub fn ticks_rounded_up(duration: Duration) -> u64 {
    let tick = OUTPUT_TICK.as_nanos();
    duration.as_nanos().div_ceil(tick) as u64
}

/// Running average of decode durations, in ticks
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeTiming {
    average_ticks: Option<u64>,
}

impl DecodeTiming {
    /// Halves the distance to each new sample; the first sample seeds it.
    pub fn record(&mut self, elapsed: Duration) {
        let sample = ticks_rounded_up(elapsed);
        self.average_ticks = Some(match self.average_ticks {
            None => sample,
            Some(average) => (average + sample) / 2,
        });
    }

    pub fn average_ticks(&self) -> u64 {
        self.average_ticks.unwrap_or(0)
    }

    /// How long to wait for the next frame, never negative
    pub fn wait_timeout(&self, service_interval: Duration) -> Duration {
        let service_ticks = (service_interval.as_nanos() / OUTPUT_TICK.as_nanos()) as u64;
        let ticks = service_ticks.saturating_sub(self.average_ticks());
        OUTPUT_TICK * ticks as u32
    }
}

/// Diagnostics shared with the status reporter
#[derive(Debug, Default)]
pub struct PlaybackStats {
    frames_played: AtomicU64,
    underflows: AtomicU64,
    decode_errors: AtomicU64,
    average_decode_ticks: AtomicU64,
    queued_frames: AtomicU64,
    playing: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackSnapshot {
    pub frames_played: u64,
    pub underflows: u64,
    pub decode_errors: u64,
    pub average_decode_ticks: u64,
    /// Queue depth seen by the last played frame
    pub queued_frames: u64,
    pub playing: bool,
}

impl PlaybackStats {
    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            frames_played: self.frames_played.load(Ordering::Relaxed),
            underflows: self.underflows.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            average_decode_ticks: self.average_decode_ticks.load(Ordering::Relaxed),
            queued_frames: self.queued_frames.load(Ordering::Relaxed),
            playing: self.playing.load(Ordering::Relaxed),
        }
    }

    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackOptions {
    /// Log and drop undecodable frames instead of faulting
    pub skip_undecodable_frames: bool,
}

/// Decode/output loop; sole owner of the output device
pub struct PlaybackEngine<C: Codec, O: AudioOutput> {
    frames: FrameReceiver,
    codec: FrameCodec<C>,
    output: O,
    buffer: PlaybackBuffer,
    timing: DecodeTiming,
    stats: Arc<PlaybackStats>,
    options: PlaybackOptions,
    fault: SharedFaultHandler,
    sample_rate: u32,
    playing: bool,
}

impl<C: Codec, O: AudioOutput> PlaybackEngine<C, O> {
    pub fn new(
        frames: FrameReceiver,
        codec: C,
        output: O,
        options: PlaybackOptions,
        fault: SharedFaultHandler,
    ) -> Self {
        Self {
            frames,
            codec: FrameCodec::new(codec, DECODE_SAMPLE_RATE, DECODE_CHANNELS),
            output,
            buffer: PlaybackBuffer::new(DECODE_CHANNELS, MAX_DECODED_FRAME_SIZE),
            timing: DecodeTiming::default(),
            stats: Arc::new(PlaybackStats::default()),
            options,
            fault,
            sample_rate: DECODE_SAMPLE_RATE,
            playing: false,
        }
    }

    pub fn stats(&self) -> Arc<PlaybackStats> {
        self.stats.clone()
    }

    pub fn codec(&self) -> &FrameCodec<C> {
        &self.codec
    }

    /// Runs until every producer of the frame queue is gone.
    pub fn run(&mut self) {
        if let Err(e) = self.output.configure(self.sample_rate) {
            self.fault.fatal("playback", &e);
        }

        while let Some(frame) = self.next_frame() {
            self.play(frame);
        }

        if self.playing {
            self.set_playing(false);
        }
        tracing::debug!("Frame queue closed, playback loop exiting");
    }

    /// Moves the engine onto its own thread.
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<()>>
    where
        C: 'static,
        O: 'static,
    {
        thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || self.run())
    }

    fn next_frame(&mut self) -> Option<EncodedFrame> {
        if self.playing {
            let timeout = self.timing.wait_timeout(self.output.service_interval());
            loop {
                match self.frames.pop_timeout(timeout) {
                    Pop::Frame(frame) if !frame.is_empty() => return Some(frame),
                    Pop::StreamStart => self.start_stream(),
                    Pop::Closed => return None,
                    Pop::Frame(_) | Pop::TimedOut => {
                        self.underflow();
                        break;
                    }
                }
            }
        }

        // output is stopped; latency no longer matters
        loop {
            match self.frames.pop() {
                Pop::Frame(frame) if !frame.is_empty() => return Some(frame),
                Pop::StreamStart => self.start_stream(),
                Pop::Closed => return None,
                Pop::Frame(_) | Pop::TimedOut => continue,
            }
        }
    }

    fn start_stream(&mut self) {
        tracing::debug!("New stream, discarding decoder state");
        self.codec.reset();
    }

    fn underflow(&mut self) {
        self.set_playing(false);
        let count = self.stats.underflows.fetch_add(1, Ordering::Relaxed) + 1;
        if count % UNDERFLOW_LOG_INTERVAL == 0 {
            tracing::warn!("Underflow at {}", count);
        } else {
            tracing::debug!("Underflow, output stopped");
        }
    }

    fn play(&mut self, frame: EncodedFrame) {
        self.stats
            .queued_frames
            .store(self.frames.len() as u64, Ordering::Relaxed);

        if !self.playing {
            self.set_playing(true);
        }

        let started = Instant::now();
        let decoded = self.codec.decode(frame.payload(), &mut self.buffer);
        self.timing.record(started.elapsed());
        self.stats
            .average_decode_ticks
            .store(self.timing.average_ticks(), Ordering::Relaxed);

        let pcm = match decoded {
            Ok(pcm) => pcm,
            Err(e) if self.options.skip_undecodable_frames => {
                tracing::warn!("Dropping undecodable frame of {} bytes: {}", frame.len(), e);
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => self.fault.fatal("playback", &e),
        };

        if let Err(e) = write_all(&mut self.output, pcm) {
            self.fault.fatal("playback", &e);
        }
        self.stats.frames_played.fetch_add(1, Ordering::Relaxed);
    }

    fn set_playing(&mut self, playing: bool) {
        let result = if playing {
            self.output.start()
        } else {
            self.output.stop()
        };
        if let Err(e) = result {
            self.fault.fatal("playback", &e);
        }
        self.playing = playing;
        self.stats.playing.store(playing, Ordering::Relaxed);
    }
}

/// Submits all of `pcm`, retrying after partial writes
fn write_all<O: AudioOutput>(output: &mut O, pcm: &[u8]) -> Result<(), AudioError> {
    let mut position = 0;
    while position < pcm.len() {
        let written = output.write(&pcm[position..])?;
        if written == 0 {
            return Err(AudioError::StreamError("output accepted no data".to_string()));
        }
        position += written;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::frame_queue;
    use crate::audio::output::testing::{OutputEvent, RecordingOutput};
    use crate::codec::decoder::testing::ByteCodec;
    use crate::codec::FrameDecoder;
    use crate::error::CodecError;
    use crate::fault::testing::panic_on_fault;
    use bytes::Bytes;

    fn frame(bytes: &[u8]) -> EncodedFrame {
        EncodedFrame::new(Bytes::copy_from_slice(bytes))
    }

    /// PCM the byte codec produces for `payload`
    fn pcm_for(payload: &[u8]) -> Vec<u8> {
        payload
            .iter()
            .flat_map(|b| {
                let l = i16::from(*b).to_le_bytes();
                let r = (-i16::from(*b)).to_le_bytes();
                [l[0], l[1], r[0], r[1]]
            })
            .collect()
    }

    fn engine(
        frames: FrameReceiver,
        output: RecordingOutput,
        options: PlaybackOptions,
    ) -> PlaybackEngine<ByteCodec, RecordingOutput> {
        PlaybackEngine::new(frames, ByteCodec, output, options, panic_on_fault())
    }

    #[test]
    fn test_ticks_round_up() {
        assert_eq!(ticks_rounded_up(Duration::ZERO), 0);
        assert_eq!(ticks_rounded_up(Duration::from_micros(1)), 1);
        assert_eq!(ticks_rounded_up(Duration::from_millis(2)), 2);
        assert_eq!(ticks_rounded_up(Duration::from_micros(2001)), 3);
    }

    #[test]
    fn test_decode_average_is_seeded_then_halved() {
        let mut timing = DecodeTiming::default();
        assert_eq!(timing.average_ticks(), 0);
        timing.record(Duration::from_millis(8));
        assert_eq!(timing.average_ticks(), 8);
        timing.record(Duration::from_millis(2));
        assert_eq!(timing.average_ticks(), 5);
        timing.record(Duration::from_millis(5));
        assert_eq!(timing.average_ticks(), 5);
    }

    #[test]
    fn test_wait_timeout_never_negative() {
        let mut timing = DecodeTiming::default();
        assert_eq!(timing.wait_timeout(Duration::from_millis(20)), Duration::from_millis(20));
        timing.record(Duration::from_millis(6));
        assert_eq!(timing.wait_timeout(Duration::from_millis(20)), Duration::from_millis(14));
        timing.record(Duration::from_millis(60));
        assert_eq!(timing.wait_timeout(Duration::from_millis(20)), Duration::ZERO);
    }

    #[test]
    fn test_frames_play_in_order_across_partial_writes() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(3, Duration::from_millis(50));
        for payload in [&[1u8, 2][..], &[3], &[4, 5, 6]] {
            tx.push(frame(payload)).unwrap();
        }
        drop(tx);

        let mut engine = engine(rx, output.clone(), PlaybackOptions::default());
        engine.run();

        let expected: Vec<u8> = [pcm_for(&[1, 2]), pcm_for(&[3]), pcm_for(&[4, 5, 6])].concat();
        assert_eq!(output.written(), expected);

        let events = output.events();
        assert_eq!(events.first(), Some(&OutputEvent::Configure(48000)));
        assert_eq!(events.get(1), Some(&OutputEvent::Start));
        assert_eq!(events.last(), Some(&OutputEvent::Stop));
        assert_eq!(engine.stats().snapshot().frames_played, 3);
        assert!(!engine.stats().is_playing());
    }

    #[test]
    fn test_underflow_stops_output_and_next_frame_restarts_it() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(usize::MAX, Duration::from_millis(5));
        let mut engine = engine(rx, output.clone(), PlaybackOptions::default());
        let stats = engine.stats();
        let handle = thread::spawn(move || engine.run());

        tx.push(frame(&[1])).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(stats.underflows(), 1);
        assert!(!stats.is_playing());

        // idle: no further underflows while waiting without a deadline
        thread::sleep(Duration::from_millis(50));
        assert_eq!(stats.underflows(), 1);

        tx.push(frame(&[2])).unwrap();
        drop(tx);
        handle.join().unwrap();

        let events = output.events();
        let starts = events.iter().filter(|e| **e == OutputEvent::Start).count();
        assert_eq!(starts, 2);
        assert_eq!(
            &events[..4],
            &[
                OutputEvent::Configure(48000),
                OutputEvent::Start,
                OutputEvent::Write(pcm_for(&[1])),
                OutputEvent::Stop,
            ]
        );
        assert_eq!(output.written(), [pcm_for(&[1]), pcm_for(&[2])].concat());
    }

    #[test]
    fn test_empty_frame_while_playing_is_underflow() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(usize::MAX, Duration::from_secs(5));
        tx.push(frame(&[1])).unwrap();
        tx.push(frame(&[])).unwrap();
        tx.push(frame(&[2])).unwrap();
        drop(tx);

        let mut engine = engine(rx, output.clone(), PlaybackOptions::default());
        engine.run();

        assert_eq!(engine.stats().underflows(), 1);
        assert_eq!(output.written(), [pcm_for(&[1]), pcm_for(&[2])].concat());
    }

    /// Writes, as every sample, how many frames its decoder instance has
    /// already decoded
    struct CountingCodec;

    struct CountingDecoder {
        decoded: i16,
    }

    impl Codec for CountingCodec {
        type Decoder = CountingDecoder;

        fn create_decoder(&self, _sample_rate: u32, _channels: u16) -> Result<CountingDecoder, CodecError> {
            Ok(CountingDecoder { decoded: 0 })
        }

        fn version(&self) -> String {
            "counting 1".to_string()
        }
    }

    impl FrameDecoder for CountingDecoder {
        fn decode(&mut self, _frame: &[u8], pcm: &mut [i16]) -> Result<usize, CodecError> {
            pcm[..2].fill(self.decoded);
            self.decoded += 1;
            Ok(1)
        }
    }

    fn counted(decoded: i16) -> Vec<u8> {
        let s = decoded.to_le_bytes();
        vec![s[0], s[1], s[0], s[1]]
    }

    #[test]
    fn test_stream_start_discards_decoder_only_for_later_frames() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(usize::MAX, Duration::from_secs(5));
        let mut engine = PlaybackEngine::new(
            rx,
            CountingCodec,
            output.clone(),
            PlaybackOptions::default(),
            panic_on_fault(),
        );

        // session A leaves a frame queued when session B starts
        tx.push(frame(b"a1")).unwrap();
        tx.push(frame(b"a2")).unwrap();
        let first = engine.next_frame().unwrap();
        engine.play(first);

        tx.start_stream().unwrap();
        tx.push(frame(b"b1")).unwrap();
        drop(tx);
        engine.run();

        assert_eq!(
            output.written(),
            [counted(0), counted(1), counted(0)].concat()
        );
        assert_eq!(engine.codec().decoders_created(), 2);
    }

    #[test]
    fn test_stream_start_while_playing_keeps_output_running() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(usize::MAX, Duration::from_secs(5));
        tx.push(frame(&[1])).unwrap();
        tx.start_stream().unwrap();
        tx.push(frame(&[2])).unwrap();
        drop(tx);

        let mut engine = engine(rx, output.clone(), PlaybackOptions::default());
        engine.run();

        assert_eq!(engine.stats().underflows(), 0);
        assert_eq!(engine.codec().decoders_created(), 2);
        assert_eq!(output.written(), [pcm_for(&[1]), pcm_for(&[2])].concat());
    }

    #[test]
    fn test_stream_start_without_frames_leaves_engine_idle() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(usize::MAX, Duration::from_millis(5));
        let mut engine = engine(rx, output.clone(), PlaybackOptions::default());
        let stats = engine.stats();
        let handle = thread::spawn(move || engine.run());

        tx.start_stream().unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!stats.is_playing());
        assert_eq!(stats.underflows(), 0);
        assert_eq!(output.written(), Vec::<u8>::new());

        tx.push(frame(&[9])).unwrap();
        drop(tx);
        handle.join().unwrap();
        assert_eq!(output.written(), pcm_for(&[9]));
    }

    #[test]
    fn test_queue_depth_is_reported() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(usize::MAX, Duration::from_secs(5));
        for payload in [&[1u8][..], &[2], &[3]] {
            tx.push(frame(payload)).unwrap();
        }
        let mut engine = engine(rx, output, PlaybackOptions::default());

        let first = engine.next_frame().unwrap();
        engine.play(first);
        assert_eq!(engine.stats().snapshot().queued_frames, 2);
        drop(tx);
    }

    #[test]
    fn test_decode_error_is_fatal_by_default() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(usize::MAX, Duration::from_secs(5));
        tx.push(frame(&[0xFF])).unwrap();
        drop(tx);

        let mut engine = engine(rx, output, PlaybackOptions::default());
        let result = thread::spawn(move || engine.run()).join();
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_error_skipped_when_configured() {
        let (tx, rx) = frame_queue(8);
        let output = RecordingOutput::new(usize::MAX, Duration::from_secs(5));
        tx.push(frame(&[0xFF])).unwrap();
        tx.push(frame(&[7])).unwrap();
        drop(tx);

        let mut engine = engine(
            rx,
            output.clone(),
            PlaybackOptions {
                skip_undecodable_frames: true,
            },
        );
        engine.run();

        let snapshot = engine.stats().snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.frames_played, 1);
        assert_eq!(output.written(), pcm_for(&[7]));
    }

    #[test]
    fn test_output_failure_is_fatal() {
        let (tx, rx) = frame_queue(8);
        let mut output = RecordingOutput::new(usize::MAX, Duration::from_secs(5));
        output.fail_writes = true;
        tx.push(frame(&[1])).unwrap();
        drop(tx);

        let mut engine = engine(rx, output, PlaybackOptions::default());
        assert!(thread::spawn(move || engine.run()).join().is_err());
    }
}
