/// Inference engine module
///
/// Owns the keyword model for the lifetime of a session. The model is loaded
/// exactly once at startup and reused for every window; re-initializing per
/// window is both a resource leak and a latency hazard, so the API makes it
/// impossible. The model contract is a named input tensor of one analysis
/// window and a single scalar output in [0, 1].

use crate::assembler::AnalysisWindow;
use ndarray::Array2;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("tensor shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
}

/// Per-window detection probability
#[derive(Debug, Clone, Copy)]
pub struct DetectionScore {
    /// Probability that the target word is present in the window (0.0 - 1.0)
    pub probability: f32,

    /// Stream time of the scored window
    pub at: Duration,
}

/// The scoring seam the pipeline consumes
#[cfg_attr(test, mockall::automock)]
pub trait Scorer: Send {
    fn score(&mut self, window: &AnalysisWindow) -> Result<DetectionScore, EngineError>;
}

/// ONNX-backed keyword scorer
pub struct OnnxEngine {
    session: Session,
    window_length: usize,
}

impl OnnxEngine {
    /// Load the model from disk. Called once at startup; failure is fatal.
    pub fn load(model_path: &Path, window_length: usize) -> Result<Self, EngineError> {
        if !model_path.exists() {
            return Err(EngineError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = (|| {
            Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(1)?
                .commit_from_file(model_path)
        })()
        .map_err(|e: ort::Error| EngineError::ModelLoad(e.to_string()))?;

        info!("loaded keyword model {}", model_path.display());

        Ok(Self {
            session,
            window_length,
        })
    }
}

impl Scorer for OnnxEngine {
    fn score(&mut self, window: &AnalysisWindow) -> Result<DetectionScore, EngineError> {
        if window.samples.len() != self.window_length {
            return Err(EngineError::ShapeMismatch {
                expected: self.window_length,
                actual: window.samples.len(),
            });
        }

        let normalized: Vec<f32> = window
            .samples
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect();

        let input = Array2::from_shape_vec((1, self.window_length), normalized)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        let tensor =
            Tensor::from_array(input).map_err(|e| EngineError::Inference(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs!["input" => tensor])
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        if output.len() != 1 {
            return Err(EngineError::ShapeMismatch {
                expected: 1,
                actual: output.len(),
            });
        }

        let raw = output.iter().next().copied().unwrap_or(f32::NAN);
        let probability = probability_from_raw(raw)?;

        Ok(DetectionScore {
            probability,
            at: window.start,
        })
    }
}

/// Map a raw model output to a probability. Values already in [0, 1] pass
/// through; anything else is treated as a single-class logit and squashed
/// through the logistic function. NaN is an inference failure.
fn probability_from_raw(raw: f32) -> Result<f32, EngineError> {
    if raw.is_nan() {
        return Err(EngineError::Inference(
            "model produced NaN output".to_string(),
        ));
    }

    if (0.0..=1.0).contains(&raw) {
        Ok(raw)
    } else {
        Ok(1.0 / (1.0 + (-raw).exp()))
    }
}
