//! Frame queue and PCM scratch buffer
//!
//! The queue is the only path from the session server to the playback
//! engine: bounded, FIFO, blocking on both ends. A full queue stalls the
//! producer instead of dropping frames.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CodecError;

/// One compressed audio frame, owned by whoever holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    payload: Bytes,
}

impl EncodedFrame {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Result of a pop
#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    Frame(EncodedFrame),
    /// every frame after this one belongs to a new stream
    StreamStart,
    TimedOut,
    /// every producer is gone
    Closed,
}

/// What travels through the queue
enum QueueItem {
    StreamStart,
    Frame(EncodedFrame),
}

/// The consumer half was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

struct QueueCounters {
    pushed: AtomicUsize,
    popped: AtomicUsize,
}

/// Producer half of the frame queue
pub struct FrameSender {
    tx: Sender<QueueItem>,
    counters: Arc<QueueCounters>,
}

/// Consumer half of the frame queue
pub struct FrameReceiver {
    rx: Receiver<QueueItem>,
    counters: Arc<QueueCounters>,
}

/// Creates a bounded frame queue holding at most `capacity` items
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = bounded(capacity);
    let counters = Arc::new(QueueCounters {
        pushed: AtomicUsize::new(0),
        popped: AtomicUsize::new(0),
    });
    (
        FrameSender {
            tx,
            counters: counters.clone(),
        },
        FrameReceiver { rx, counters },
    )
}

impl FrameSender {
    /// Blocks while the queue is full.
    pub fn push(&self, frame: EncodedFrame) -> Result<(), QueueClosed> {
        self.tx.send(QueueItem::Frame(frame)).map_err(|_| QueueClosed)?;
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Marks a stream boundary. The consumer sees it after every frame
    /// pushed before it and before every frame pushed after it.
    pub fn start_stream(&self) -> Result<(), QueueClosed> {
        self.tx.send(QueueItem::StreamStart).map_err(|_| QueueClosed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl FrameReceiver {
    /// Waits at most `timeout` for the next item
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => self.unpack(item),
            Err(RecvTimeoutError::Timeout) => Pop::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    /// Waits indefinitely for the next item
    pub fn pop(&self) -> Pop {
        match self.rx.recv() {
            Ok(item) => self.unpack(item),
            Err(_) => Pop::Closed,
        }
    }

    fn unpack(&self, item: QueueItem) -> Pop {
        match item {
            QueueItem::Frame(frame) => {
                self.counters.popped.fetch_add(1, Ordering::Relaxed);
                Pop::Frame(frame)
            }
            QueueItem::StreamStart => Pop::StreamStart,
        }
    }

    /// Items currently queued, stream markers included
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Frames pushed and popped since creation
    pub fn totals(&self) -> (usize, usize) {
        (
            self.counters.pushed.load(Ordering::Relaxed),
            self.counters.popped.load(Ordering::Relaxed),
        )
    }
}

/// Fixed-size PCM scratch space, reused for every frame
pub struct PlaybackBuffer {
    samples: Vec<i16>,
    bytes: Vec<u8>,
    channels: u16,
}

impl PlaybackBuffer {
    /// `capacity_bytes` is the largest decoded frame in bytes
    pub fn new(channels: u16, capacity_bytes: usize) -> Self {
        let sample_count = capacity_bytes / std::mem::size_of::<i16>();
        Self {
            samples: vec![0; sample_count],
            bytes: vec![0; sample_count * std::mem::size_of::<i16>()],
            channels,
        }
    }

    /// Space the decoder writes interleaved samples into
    pub fn pcm_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }

    /// Serializes the first `samples_per_channel` frames as little-endian
    /// bytes and returns them.
    pub fn commit(&mut self, samples_per_channel: usize) -> Result<&[u8], CodecError> {
        let count = samples_per_channel * self.channels as usize;
        if count > self.samples.len() {
            return Err(CodecError::InvalidFrameSize(count));
        }
        for (dst, sample) in self.bytes.chunks_exact_mut(2).zip(&self.samples[..count]) {
            dst.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(&self.bytes[..count * 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn frame(bytes: &'static [u8]) -> EncodedFrame {
        EncodedFrame::new(Bytes::from_static(bytes))
    }

    #[test]
    fn test_queue_is_fifo() {
        let (tx, rx) = frame_queue(4);
        tx.push(frame(b"f1")).unwrap();
        tx.push(frame(b"f2")).unwrap();
        tx.push(frame(b"f3")).unwrap();
        assert_eq!(rx.len(), 3);

        assert_eq!(rx.pop(), Pop::Frame(frame(b"f1")));
        assert_eq!(rx.pop(), Pop::Frame(frame(b"f2")));
        assert_eq!(rx.pop_timeout(Duration::from_millis(10)), Pop::Frame(frame(b"f3")));
        assert_eq!(rx.totals(), (3, 3));
    }

    #[test]
    fn test_stream_start_keeps_its_place() {
        let (tx, rx) = frame_queue(4);
        tx.push(frame(b"a1")).unwrap();
        tx.start_stream().unwrap();
        tx.push(frame(b"b1")).unwrap();

        assert_eq!(rx.pop(), Pop::Frame(frame(b"a1")));
        assert_eq!(rx.pop(), Pop::StreamStart);
        assert_eq!(rx.pop(), Pop::Frame(frame(b"b1")));
        assert_eq!(rx.totals(), (2, 2));
    }

    #[test]
    fn test_pop_timeout_on_empty_queue() {
        let (_tx, rx) = frame_queue(4);
        let started = Instant::now();
        assert_eq!(rx.pop_timeout(Duration::from_millis(20)), Pop::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_reports_closed_queue() {
        let (tx, rx) = frame_queue(4);
        drop(tx);
        assert_eq!(rx.pop(), Pop::Closed);
        assert_eq!(rx.pop_timeout(Duration::from_millis(1)), Pop::Closed);
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        let (tx, rx) = frame_queue(1);
        tx.push(frame(b"a")).unwrap();

        let producer = thread::spawn(move || {
            let started = Instant::now();
            tx.push(frame(b"b")).unwrap();
            started.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(rx.pop(), Pop::Frame(frame(b"a")));
        let blocked_for = producer.join().unwrap();
        assert!(blocked_for >= Duration::from_millis(40));
        assert_eq!(rx.pop(), Pop::Frame(frame(b"b")));
    }

    #[test]
    fn test_push_fails_when_consumer_gone() {
        let (tx, rx) = frame_queue(2);
        drop(rx);
        assert_eq!(tx.push(frame(b"x")), Err(QueueClosed));
        assert_eq!(tx.start_stream(), Err(QueueClosed));
    }

    #[test]
    fn test_playback_buffer_commit() {
        let mut buffer = PlaybackBuffer::new(2, 16);
        buffer.pcm_mut()[..4].copy_from_slice(&[1, -1, 256, -256]);
        assert_eq!(buffer.commit(2).unwrap(), &[1, 0, 0xFF, 0xFF, 0, 1, 0, 0xFF]);
        assert!(buffer.commit(5).is_err());
        assert_eq!(buffer.commit(0).unwrap(), &[] as &[u8]);
    }
}
