/// Pipeline orchestration module
///
/// Wires the components into two cooperating stages: a capture stage that
/// owns the blocking audio read and pushes chunks into a bounded queue, and a
/// processing stage that drains the queue, assembles windows, runs inference
/// and drives the debouncer and counter. The split keeps a slow inference
/// call from backing up the OS audio buffer; the bounded queue trades
/// completeness for bounded latency under sustained overload.

use crate::assembler::{AnalysisWindow, AssemblerError, FrameAssembler};
use crate::config::{ConfigError, PipelineConfig};
use crate::counter::WordCounter;
use crate::debounce::{DebounceError, DetectionDebouncer, DetectionEvent};
use crate::engine::{DetectionScore, EngineError, Scorer};
use crate::source::{AudioChunk, AudioSource, SourceError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Assembler(#[from] AssemblerError),

    #[error(transparent)]
    Debounce(#[from] DebounceError),

    #[error("audio source failed: {0}")]
    Source(#[from] SourceError),

    #[error("inference engine failed: {0}")]
    Engine(#[from] EngineError),

    #[error("pipeline task aborted: {0}")]
    TaskAborted(String),
}

/// Counters shared between the stages and the handle
#[derive(Debug, Default)]
struct SharedStats {
    chunks_captured: AtomicU64,
    chunks_dropped: AtomicU64,
    windows_scored: AtomicU64,
    inference_failures: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self, words_detected: u64) -> PipelineStats {
        PipelineStats {
            chunks_captured: self.chunks_captured.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            windows_scored: self.windows_scored.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            words_detected,
        }
    }
}

/// Point-in-time pipeline statistics
#[derive(Debug, Clone, Copy)]
pub struct PipelineStats {
    pub chunks_captured: u64,
    pub chunks_dropped: u64,
    pub windows_scored: u64,
    pub inference_failures: u64,
    pub words_detected: u64,
}

/// Result of a completed session
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub final_count: u64,
    pub stats: PipelineStats,
}

/// Bounded chunk queue between the capture and processing stages.
///
/// When full, the oldest unconsumed chunk is evicted so capture latency stays
/// bounded; unbounded queuing would grow memory without limit on sustained
/// overload.
struct ChunkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

struct QueueInner {
    chunks: VecDeque<AudioChunk>,
    closed: bool,
}

impl ChunkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a chunk. Returns true if the oldest chunk was evicted.
    fn push(&self, chunk: AudioChunk) -> bool {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            let dropped = if inner.chunks.len() >= self.capacity {
                inner.chunks.pop_front();
                true
            } else {
                false
            };
            inner.chunks.push_back(chunk);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Mark the stream finished. Pending and future pops drain the remaining
    /// chunks, then return `None`.
    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    /// Wait for the next chunk in capture order.
    async fn pop(&self) -> Option<AudioChunk> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(chunk) = inner.chunks.pop_front() {
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }
}

/// Everything the processing stage owns exclusively
struct ProcessingStage {
    engine: Box<dyn Scorer>,
    assembler: FrameAssembler,
    debouncer: DetectionDebouncer,
    counter: WordCounter,
    stats: Arc<SharedStats>,
    event_tx: mpsc::UnboundedSender<DetectionEvent>,
}

impl ProcessingStage {
    /// Feed one chunk and score every window that becomes ready.
    fn ingest(&mut self, chunk: &AudioChunk) -> Result<(), PipelineError> {
        self.assembler.push(chunk);
        while let Some(window) = self.assembler.next_window() {
            self.score_window(&window)?;
        }
        Ok(())
    }

    /// Stream ended: score the zero-padded tail, if any.
    fn finish(&mut self) -> Result<(), PipelineError> {
        if let Some(window) = self.assembler.flush() {
            self.score_window(&window)?;
        }
        Ok(())
    }

    fn score_window(&mut self, window: &AnalysisWindow) -> Result<(), PipelineError> {
        let score = match self.engine.score(window) {
            Ok(score) => {
                self.stats.windows_scored.fetch_add(1, Ordering::Relaxed);
                score
            }
            Err(e) => {
                // A failure on the very first inference call means the model
                // and window shape never matched: fatal. Later failures are
                // transient; the window is skipped as a zero score.
                if self.stats.windows_scored.load(Ordering::Relaxed) == 0 {
                    error!("first inference call failed: {e}");
                    return Err(e.into());
                }
                self.stats.inference_failures.fetch_add(1, Ordering::Relaxed);
                warn!("inference failed, window skipped: {e}");
                DetectionScore {
                    probability: 0.0,
                    at: window.start,
                }
            }
        };

        if let Some(event) = self.debouncer.update(score) {
            let count = self.counter.on_event(&event);
            info!(count, at_ms = event.at.as_millis() as u64, "target word detected");
            if self.event_tx.send(event).is_err() {
                debug!("event receiver dropped");
            }
        }

        Ok(())
    }
}

/// A configured, not-yet-running session
pub struct Pipeline {
    config: PipelineConfig,
    source: Box<dyn AudioSource>,
    engine: Box<dyn Scorer>,
}

impl Pipeline {
    /// Validate the configuration and assemble a session. The engine must
    /// already be loaded and the source already open; both failures are fatal
    /// at startup and belong to the caller.
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn AudioSource>,
        engine: Box<dyn Scorer>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            engine,
        })
    }

    /// Spawn the capture and processing stages. Must be called within a
    /// tokio runtime.
    pub fn start(self) -> Result<PipelineHandle, PipelineError> {
        let Pipeline {
            config,
            mut source,
            engine,
        } = self;

        let assembler = FrameAssembler::new(&config)?;
        let debouncer = DetectionDebouncer::new(config.threshold, config.refractory_period)?;

        let queue = Arc::new(ChunkQueue::new(config.queue_capacity));
        let stats = Arc::new(SharedStats::default());
        let counter = WordCounter::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            "starting pipeline: window {} samples, stride {}, threshold {}, refractory {:?}",
            config.window_length, config.stride, config.threshold, config.refractory_period
        );

        // Capture stage: owns the blocking read and the source's lifetime.
        let capture_task = {
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&stats);
            let mut shutdown_rx = shutdown_rx.clone();

            tokio::spawn(async move {
                let result = loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            debug!("capture stage: stop signal received");
                            break Ok(());
                        }
                        read = source.read_next() => match read {
                            Ok(chunk) => {
                                stats.chunks_captured.fetch_add(1, Ordering::Relaxed);
                                if queue.push(chunk) {
                                    stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                                    warn!("backpressure: dropped oldest queued chunk");
                                }
                            }
                            Err(SourceError::StreamClosed) => {
                                info!("audio stream ended");
                                break Ok(());
                            }
                            Err(e) => {
                                error!("audio capture failed: {e}");
                                break Err(PipelineError::Source(e));
                            }
                        }
                    }
                };

                queue.close();
                source.close();
                result
            })
        };

        // Processing stage: windows, inference, debounce, count.
        let processing_task = {
            let queue = Arc::clone(&queue);
            let mut shutdown_rx = shutdown_rx;
            let mut stage = ProcessingStage {
                engine,
                assembler,
                debouncer,
                counter: counter.clone(),
                stats: Arc::clone(&stats),
                event_tx,
            };

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            debug!("processing stage: stop signal received");
                            return Ok(());
                        }
                        popped = queue.pop() => match popped {
                            Some(chunk) => stage.ingest(&chunk)?,
                            None => {
                                // Natural stream end; an explicit stop
                                // discards the buffered tail instead.
                                if !*shutdown_rx.borrow() {
                                    stage.finish()?;
                                }
                                return Ok(());
                            }
                        }
                    }
                }
            })
        };

        Ok(PipelineHandle {
            shutdown_tx,
            capture_task,
            processing_task,
            event_rx,
            counter,
            stats,
        })
    }
}

/// Handle to a running session
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    capture_task: JoinHandle<Result<(), PipelineError>>,
    processing_task: JoinHandle<Result<(), PipelineError>>,
    event_rx: mpsc::UnboundedReceiver<DetectionEvent>,
    counter: WordCounter,
    stats: Arc<SharedStats>,
}

impl PipelineHandle {
    /// Wait for the next confirmed detection. Returns `None` once the
    /// session has ended and all events were consumed.
    pub async fn recv_event(&mut self) -> Option<DetectionEvent> {
        self.event_rx.recv().await
    }

    /// Non-blocking variant of [`recv_event`](Self::recv_event)
    pub fn try_recv_event(&mut self) -> Option<DetectionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// A counter handle that stays readable after shutdown
    pub fn counter(&self) -> WordCounter {
        self.counter.clone()
    }

    /// Current statistics
    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot(self.counter.snapshot())
    }

    /// Raise the stop signal, wait for both stages to finish and release
    /// their resources, and return the session summary. Nothing blocks
    /// indefinitely once the signal is raised: pending reads are abandoned at
    /// their suspension points.
    pub async fn shutdown(self) -> Result<PipelineSummary, PipelineError> {
        let PipelineHandle {
            shutdown_tx,
            capture_task,
            processing_task,
            event_rx,
            counter,
            stats,
        } = self;

        let _ = shutdown_tx.send(true);
        drop(event_rx);

        let processing = match processing_task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::TaskAborted(e.to_string())),
        };
        let capture = match capture_task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::TaskAborted(e.to_string())),
        };

        processing?;
        capture?;

        let summary = PipelineSummary {
            final_count: counter.snapshot(),
            stats: stats.snapshot(counter.snapshot()),
        };

        info!(
            "pipeline stopped: {} words, {} windows scored, {} chunks dropped",
            summary.final_count, summary.stats.windows_scored, summary.stats.chunks_dropped
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockScorer;
    use crate::source::MockAudioSource;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Small config where one sample is 125ms of stream time: window 500ms,
    /// stride 250ms, refractory 500ms (two strides).
    fn test_config() -> PipelineConfig {
        PipelineConfig {
            sample_rate: 8,
            window_length: 4,
            stride: 2,
            chunk_size: 4,
            queue_capacity: 8,
            threshold: 0.5,
            refractory_period: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn scripted_source(chunks: Vec<Vec<i16>>) -> Box<MockAudioSource> {
        let mut source = MockAudioSource::new();
        let mut remaining: VecDeque<Vec<i16>> = chunks.into();
        source.expect_read_next().returning(move || {
            remaining
                .pop_front()
                .map(AudioChunk::new)
                .ok_or(SourceError::StreamClosed)
        });
        source.expect_close().return_const(());
        Box::new(source)
    }

    fn scripted_scorer(scores: Vec<Result<f32, ()>>) -> Box<MockScorer> {
        let mut scorer = MockScorer::new();
        let mut remaining: VecDeque<Result<f32, ()>> = scores.into();
        scorer.expect_score().returning(move |window| {
            match remaining.pop_front().unwrap_or(Ok(0.0)) {
                Ok(probability) => Ok(DetectionScore {
                    probability,
                    at: window.start,
                }),
                Err(()) => Err(EngineError::Inference("scripted failure".to_string())),
            }
        });
        Box::new(scorer)
    }

    #[tokio::test]
    async fn test_events_match_counter() {
        // 12 samples yield 5 full windows plus a padded tail: 6 scores.
        let source = scripted_source(vec![vec![0; 4], vec![0; 4], vec![0; 4]]);
        let scorer = scripted_scorer(
            [0.8, 0.9, 0.2, 0.2, 0.9, 0.1]
                .into_iter()
                .map(Ok)
                .collect(),
        );

        let pipeline = Pipeline::new(test_config(), source, scorer).unwrap();
        let mut handle = pipeline.start().unwrap();
        let counter = handle.counter();

        let mut events = Vec::new();
        while let Some(event) = handle.recv_event().await {
            events.push(event);
        }

        assert_eq!(events.len(), 2);
        assert_eq!(counter.snapshot(), 2);
        // First event on the first window, second once the refractory
        // elapsed (window 5 starts 1000ms in).
        assert_eq!(events[0].at, Duration::ZERO);
        assert_eq!(events[1].at, Duration::from_millis(1000));

        let summary = handle.shutdown().await.unwrap();
        assert_eq!(summary.final_count, 2);
        assert_eq!(summary.stats.windows_scored, 6);
        assert_eq!(summary.stats.chunks_captured, 3);
        assert_eq!(summary.stats.inference_failures, 0);
    }

    #[tokio::test]
    async fn test_transient_inference_failure_skips_window() {
        // The failing window is treated as a zero score, which ends the
        // active run instead of emitting anything.
        let source = scripted_source(vec![vec![0; 4], vec![0; 4], vec![0; 4]]);
        let scorer = scripted_scorer(vec![
            Ok(0.8),
            Err(()),
            Ok(0.2),
            Ok(0.2),
            Ok(0.9),
            Ok(0.1),
        ]);

        let pipeline = Pipeline::new(test_config(), source, scorer).unwrap();
        let mut handle = pipeline.start().unwrap();

        let mut events = 0;
        while handle.recv_event().await.is_some() {
            events += 1;
        }

        let summary = handle.shutdown().await.unwrap();
        assert_eq!(events, 2);
        assert_eq!(summary.final_count, 2);
        assert_eq!(summary.stats.inference_failures, 1);
        assert_eq!(summary.stats.windows_scored, 5);
    }

    #[tokio::test]
    async fn test_first_inference_failure_is_fatal() {
        let source = scripted_source(vec![vec![0; 4], vec![0; 4]]);
        let scorer = scripted_scorer(vec![Err(()), Err(())]);

        let pipeline = Pipeline::new(test_config(), source, scorer).unwrap();
        let mut handle = pipeline.start().unwrap();

        assert!(handle.recv_event().await.is_none());

        let result = handle.shutdown().await;
        assert!(matches!(result, Err(PipelineError::Engine(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.threshold = 2.0;

        let result = Pipeline::new(
            config,
            scripted_source(Vec::new()),
            scripted_scorer(Vec::new()),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    /// A source whose read never completes, for shutdown testing.
    struct PendingSource {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AudioSource for PendingSource {
        async fn read_next(&mut self) -> Result<AudioChunk, SourceError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_pending_read() {
        let closes = Arc::new(AtomicUsize::new(0));
        let source = Box::new(PendingSource {
            closes: Arc::clone(&closes),
        });
        let scorer = scripted_scorer(Vec::new());

        let pipeline = Pipeline::new(test_config(), source, scorer).unwrap();
        let handle = pipeline.start().unwrap();
        let counter = handle.counter();

        let summary = tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("shutdown must complete in bounded time")
            .unwrap();

        assert_eq!(summary.final_count, 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        // The count stays readable after shutdown.
        assert_eq!(counter.snapshot(), 0);
    }

    #[tokio::test]
    async fn test_queue_evicts_oldest_when_full() {
        let queue = ChunkQueue::new(2);

        assert!(!queue.push(AudioChunk::new(vec![1])));
        assert!(!queue.push(AudioChunk::new(vec![2])));
        assert!(queue.push(AudioChunk::new(vec![3])));
        assert_eq!(queue.len(), 2);

        // The oldest chunk was evicted; order of the rest is preserved.
        assert_eq!(queue.pop().await.unwrap().samples, vec![2]);
        assert_eq!(queue.pop().await.unwrap().samples, vec![3]);

        queue.close();
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_queue_drains_remaining_chunks_after_close() {
        let queue = ChunkQueue::new(4);
        queue.push(AudioChunk::new(vec![1]));
        queue.push(AudioChunk::new(vec![2]));
        queue.close();

        assert_eq!(queue.pop().await.unwrap().samples, vec![1]);
        assert_eq!(queue.pop().await.unwrap().samples, vec![2]);
        assert!(queue.pop().await.is_none());

        // Pushes after close are ignored.
        assert!(!queue.push(AudioChunk::new(vec![3])));
        assert!(queue.pop().await.is_none());
    }
}
