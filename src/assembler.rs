/// Frame assembly module
///
/// Converts a stream of arbitrarily-sized capture chunks into fixed-length
/// analysis windows with a configurable overlap, so an utterance straddling a
/// chunk boundary is not lost. Backed by a ring buffer that retains the
/// overlap between consecutive windows.

use crate::config::PipelineConfig;
use crate::source::{AudioChunk, AudioSample};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

#[derive(Error, Debug)]
pub enum AssemblerError {
    #[error("window length must be > 0")]
    ZeroWindowLength,

    #[error("stride {stride} must be between 1 and window length {window_length} - 1")]
    InvalidStride { stride: usize, window_length: usize },
}

/// Fixed-length sample sequence submitted to the model for one inference
#[derive(Debug, Clone)]
pub struct AnalysisWindow {
    /// Exactly `window_length` samples, never mutated after creation
    pub samples: Vec<AudioSample>,

    /// Stream time of the first sample (offset from session start)
    pub start: Duration,
}

/// Accumulates capture chunks and emits overlapping analysis windows
pub struct FrameAssembler {
    producer: RingProducer,
    consumer: RingConsumer,
    window_length: usize,
    stride: usize,
    sample_rate: u32,
    pad_final: bool,
    /// Absolute stream index of the oldest buffered sample
    head_offset: u64,
}

impl FrameAssembler {
    pub fn new(config: &PipelineConfig) -> Result<Self, AssemblerError> {
        if config.window_length == 0 {
            return Err(AssemblerError::ZeroWindowLength);
        }
        if config.stride == 0 || config.stride >= config.window_length {
            return Err(AssemblerError::InvalidStride {
                stride: config.stride,
                window_length: config.window_length,
            });
        }

        // Enough room for a full window plus several chunks of slack; the
        // pipeline drains ready windows after every push.
        let capacity = config.window_length + config.chunk_size * 4;
        debug!("creating frame assembler with capacity {} samples", capacity);

        let (producer, consumer) = RingBuffer::new(capacity).split();

        Ok(Self {
            producer,
            consumer,
            window_length: config.window_length,
            stride: config.stride,
            sample_rate: config.sample_rate,
            pad_final: config.pad_final_window,
            head_offset: 0,
        })
    }

    /// Append a chunk to the rolling buffer.
    ///
    /// Returns the number of samples discarded. Normally zero; if the caller
    /// stops draining windows the oldest samples are dropped to make room.
    pub fn push(&mut self, chunk: &AudioChunk) -> usize {
        let incoming = chunk.samples.len();
        let vacant = self.producer.vacant_len();

        let mut dropped = 0;
        if incoming > vacant {
            dropped = incoming - vacant;
            let skipped = self.consumer.skip(dropped);
            self.head_offset += skipped as u64;
            warn!("analysis buffer full, dropped {} oldest samples", dropped);
        }

        let written = self.producer.push_slice(&chunk.samples);
        if written < incoming {
            // Chunk larger than the whole buffer; the unwritten tail is lost.
            dropped += incoming - written;
            warn!(
                "chunk of {} samples exceeds buffer capacity, {} samples lost",
                incoming,
                incoming - written
            );
        }

        dropped
    }

    /// Emit the next analysis window, advancing by `stride` and retaining the
    /// overlap. Returns `None` until a full window's worth of samples is
    /// buffered.
    pub fn next_window(&mut self) -> Option<AnalysisWindow> {
        if self.consumer.occupied_len() < self.window_length {
            return None;
        }

        let samples: Vec<AudioSample> = self
            .consumer
            .iter()
            .take(self.window_length)
            .copied()
            .collect();
        let start = self.stream_time(self.head_offset);

        let skipped = self.consumer.skip(self.stride);
        self.head_offset += skipped as u64;

        Some(AnalysisWindow { samples, start })
    }

    /// Finish the stream. With padding enabled, any trailing samples are
    /// zero-padded into one last full-length window; otherwise they are
    /// dropped.
    pub fn flush(&mut self) -> Option<AnalysisWindow> {
        let occupied = self.consumer.occupied_len();
        if occupied == 0 {
            return None;
        }

        if !self.pad_final {
            debug!("dropping {} trailing samples at stream end", occupied);
            let skipped = self.consumer.skip(occupied);
            self.head_offset += skipped as u64;
            return None;
        }

        let mut samples: Vec<AudioSample> =
            self.consumer.iter().take(occupied).copied().collect();
        samples.resize(self.window_length, 0);
        let start = self.stream_time(self.head_offset);

        let skipped = self.consumer.skip(occupied);
        self.head_offset += skipped as u64;

        debug!(
            "emitting zero-padded final window ({} real samples)",
            occupied
        );

        Some(AnalysisWindow { samples, start })
    }

    /// Number of samples currently buffered
    pub fn buffered(&self) -> usize {
        self.consumer.occupied_len()
    }

    fn stream_time(&self, offset: u64) -> Duration {
        Duration::from_secs_f64(offset as f64 / self.sample_rate as f64)
    }
}
