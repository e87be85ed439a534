/// Keyword counting pipeline library
///
/// Streams microphone audio through a pre-trained keyword-detection model and
/// maintains a debounced, monotonically increasing count of how many times
/// the target word was spoken.

pub mod assembler;
pub mod config;
pub mod counter;
pub mod debounce;
pub mod engine;
pub mod pipeline;
pub mod source;

// Re-export main types
pub use assembler::{AnalysisWindow, AssemblerError, FrameAssembler};
pub use config::{ConfigError, PipelineConfig};
pub use counter::WordCounter;
pub use debounce::{DebounceState, DetectionDebouncer, DetectionEvent};
pub use engine::{DetectionScore, EngineError, OnnxEngine, Scorer};
pub use pipeline::{Pipeline, PipelineError, PipelineHandle, PipelineStats, PipelineSummary};
pub use source::{AudioChunk, AudioSample, AudioSource, MicSource, SourceError, WavSource};
