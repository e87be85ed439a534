/// Audio source module
///
/// Abstracts the platform microphone behind the `AudioSource` trait: a source
/// produces fixed-format PCM chunks (mono 16-bit signed, at the configured
/// sample rate) until it is closed or the underlying stream ends. `MicSource`
/// captures from the default input device via cpal; `WavSource` replays a
/// recording through the identical pipeline.

use crate::config::PipelineConfig;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use std::collections::VecDeque;
use std::path::Path;
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Capacity of the hand-off channel between the realtime capture callback and
/// `read_next`. The reader only moves chunks into the pipeline queue, so this
/// fills only when the whole process is stalled.
const MIC_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio stream closed")]
    StreamClosed,

    #[error("unsupported audio format: {0}")]
    InvalidFormat(String),
}

/// One captured buffer of PCM samples
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono 16-bit samples, immutable after capture
    pub samples: Vec<AudioSample>,

    /// Wall-clock capture time, for observability only
    pub captured_at: Instant,
}

impl AudioChunk {
    pub fn new(samples: Vec<AudioSample>) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A stream of fixed-format PCM chunks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSource: Send {
    /// Wait for the next chunk. Returns `StreamClosed` once the stream ends.
    async fn read_next(&mut self) -> Result<AudioChunk, SourceError>;

    /// Release the underlying device. Idempotent.
    fn close(&mut self);
}

/// Microphone capture source
///
/// The cpal stream is not `Send`, so it lives on a dedicated worker thread
/// that builds it, keeps the device open, and drops it when the source is
/// closed. Chunks are handed to `read_next` through a bounded channel.
pub struct MicSource {
    rx: mpsc::Receiver<AudioChunk>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl MicSource {
    /// Open the default input device for exclusive use by this session.
    pub fn open(config: &PipelineConfig) -> Result<Self, SourceError> {
        let (chunk_tx, chunk_rx) = mpsc::channel(MIC_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let sample_rate = config.sample_rate;
        let chunk_size = config.chunk_size;

        let worker = thread::Builder::new()
            .name("wordspot-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(sample_rate, chunk_size, chunk_tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Hold the device until asked to stop, then release it.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| {
                SourceError::DeviceUnavailable(format!("failed to spawn capture thread: {e}"))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("microphone opened at {} Hz, chunk size {}", sample_rate, chunk_size);
                Ok(Self {
                    rx: chunk_rx,
                    stop_tx: Some(stop_tx),
                    worker: Some(worker),
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(SourceError::DeviceUnavailable(
                "capture thread exited before the stream was ready".to_string(),
            )),
        }
    }
}

#[async_trait]
impl AudioSource for MicSource {
    async fn read_next(&mut self) -> Result<AudioChunk, SourceError> {
        self.rx.recv().await.ok_or(SourceError::StreamClosed)
    }

    fn close(&mut self) {
        if self.stop_tx.take().is_some() {
            info!("releasing audio device");
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
        }
        self.rx.close();
    }
}

impl Drop for MicSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(
    sample_rate: u32,
    chunk_size: usize,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream, SourceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        SourceError::DeviceUnavailable("no input device available".to_string())
    })?;

    // Prefer a native mono i16 configuration at the requested rate.
    let native = device
        .supported_input_configs()
        .map_err(|e| {
            SourceError::DeviceUnavailable(format!("failed to query input configs: {e}"))
        })?
        .filter(|c| c.channels() == 1 && c.sample_format() == SampleFormat::I16)
        .find(|c| c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate);

    let stream = match native {
        Some(range) => {
            let config = range.with_sample_rate(SampleRate(sample_rate)).config();
            build_i16_stream(&device, &config, 1, chunk_size, tx)?
        }
        None => {
            // Fall back to the device default and convert in the callback.
            let default = device.default_input_config().map_err(|e| {
                SourceError::DeviceUnavailable(format!("no default input config: {e}"))
            })?;

            if default.sample_rate().0 != sample_rate {
                return Err(SourceError::InvalidFormat(format!(
                    "device does not support {} Hz capture (default is {} Hz)",
                    sample_rate,
                    default.sample_rate().0
                )));
            }

            let channels = default.channels() as usize;
            let config = default.config();

            match default.sample_format() {
                SampleFormat::I16 => build_i16_stream(&device, &config, channels, chunk_size, tx)?,
                SampleFormat::F32 => build_f32_stream(&device, &config, channels, chunk_size, tx)?,
                other => {
                    return Err(SourceError::InvalidFormat(format!(
                        "unsupported sample format {other:?}"
                    )))
                }
            }
        }
    };

    stream
        .play()
        .map_err(|e| SourceError::DeviceUnavailable(format!("failed to start stream: {e}")))?;

    Ok(stream)
}

fn build_i16_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    chunk_size: usize,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream, SourceError> {
    let mut pending: Vec<AudioSample> = Vec::with_capacity(chunk_size * 2);

    device
        .build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if channels == 1 {
                    pending.extend_from_slice(data);
                } else {
                    pending.extend(data.chunks_exact(channels).map(|frame| frame[0]));
                }
                deliver_chunks(&mut pending, chunk_size, &tx);
            },
            stream_error,
            None,
        )
        .map_err(|e| SourceError::DeviceUnavailable(format!("failed to build input stream: {e}")))
}

fn build_f32_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    chunk_size: usize,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream, SourceError> {
    let mut pending: Vec<AudioSample> = Vec::with_capacity(chunk_size * 2);

    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                pending.extend(
                    data.chunks_exact(channels)
                        .map(|frame| (frame[0] * 32767.0).clamp(-32768.0, 32767.0) as i16),
                );
                deliver_chunks(&mut pending, chunk_size, &tx);
            },
            stream_error,
            None,
        )
        .map_err(|e| SourceError::DeviceUnavailable(format!("failed to build input stream: {e}")))
}

/// Hand complete chunks to the reader. Runs on the realtime callback thread:
/// never blocks, never logs. If the reader is stalled the chunk is dropped.
fn deliver_chunks(pending: &mut Vec<AudioSample>, chunk_size: usize, tx: &mpsc::Sender<AudioChunk>) {
    while pending.len() >= chunk_size {
        let samples: Vec<AudioSample> = pending.drain(..chunk_size).collect();
        let _ = tx.try_send(AudioChunk::new(samples));
    }
}

fn stream_error(err: cpal::StreamError) {
    error!("audio stream error: {err}");
}

/// Replays a WAV recording as if it were live capture.
///
/// The file must match the session format exactly (mono, 16-bit signed PCM at
/// the configured sample rate); there is no resampling.
pub struct WavSource {
    chunks: VecDeque<Vec<AudioSample>>,
}

impl WavSource {
    pub fn open(path: &Path, config: &PipelineConfig) -> Result<Self, SourceError> {
        let reader = hound::WavReader::open(path).map_err(|e| {
            SourceError::DeviceUnavailable(format!("cannot open {}: {e}", path.display()))
        })?;

        let spec = reader.spec();
        if spec.channels != 1 {
            return Err(SourceError::InvalidFormat(format!(
                "expected mono audio, got {} channels",
                spec.channels
            )));
        }
        if spec.sample_rate != config.sample_rate {
            return Err(SourceError::InvalidFormat(format!(
                "expected {} Hz, got {} Hz",
                config.sample_rate, spec.sample_rate
            )));
        }
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(SourceError::InvalidFormat(format!(
                "expected 16-bit signed PCM, got {}-bit {:?}",
                spec.bits_per_sample, spec.sample_format
            )));
        }

        let samples: Vec<AudioSample> = reader
            .into_samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| SourceError::InvalidFormat(format!("failed to decode samples: {e}")))?;

        info!(
            "replaying {} ({} samples, {:.2}s)",
            path.display(),
            samples.len(),
            samples.len() as f64 / config.sample_rate as f64
        );

        let chunks = samples
            .chunks(config.chunk_size)
            .map(|c| c.to_vec())
            .collect();

        Ok(Self { chunks })
    }
}

#[async_trait]
impl AudioSource for WavSource {
    async fn read_next(&mut self) -> Result<AudioChunk, SourceError> {
        self.chunks
            .pop_front()
            .map(AudioChunk::new)
            .ok_or(SourceError::StreamClosed)
    }

    fn close(&mut self) {
        self.chunks.clear();
    }
}
