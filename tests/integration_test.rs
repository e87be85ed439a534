/// Integration tests for the keyword counting pipeline
///
/// Runs the full pipeline over synthetic WAV recordings with a scripted
/// scorer standing in for the model, and checks the debounced count.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wordspot::{
    AnalysisWindow, DetectionDebouncer, DetectionScore, EngineError, Pipeline, PipelineConfig,
    Scorer, WavSource, WordCounter,
};

/// Session with 25ms of stream time per stride: window 50ms, refractory two
/// strides.
fn test_config() -> PipelineConfig {
    PipelineConfig {
        sample_rate: 8_000,
        window_length: 400,
        stride: 200,
        chunk_size: 160,
        queue_capacity: 32,
        threshold: 0.5,
        refractory_period: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Generate a synthetic speech-like tone
fn generate_tone(frequency: f32, sample_rate: u32, num_samples: usize, amplitude: f32) -> Vec<i16> {
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let sample = amplitude * (2.0 * PI * frequency * t).sin();
            (sample * i16::MAX as f32) as i16
        })
        .collect()
}

fn write_wav(path: &Path, sample_rate: u32, samples: &[i16]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
}

/// Returns per-window probabilities from a fixed script, 0.0 once exhausted.
struct ScriptedScorer {
    scores: VecDeque<f32>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedScorer {
    fn new(scores: &[f32]) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                scores: scores.iter().copied().collect(),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl Scorer for ScriptedScorer {
    fn score(&mut self, window: &AnalysisWindow) -> Result<DetectionScore, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DetectionScore {
            probability: self.scores.pop_front().unwrap_or(0.0),
            at: window.start,
        })
    }
}

#[tokio::test]
async fn test_two_utterances_in_one_recording() {
    let config = test_config();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utterances.wav");

    // 2000 samples: 9 full windows plus one zero-padded tail.
    let audio = generate_tone(200.0, config.sample_rate, 2_000, 0.4);
    write_wav(&path, config.sample_rate, &audio);

    // Two above-threshold runs separated by a gap longer than the
    // refractory period; the dip inside the first run is absorbed.
    let (scorer, calls) =
        ScriptedScorer::new(&[0.9, 0.9, 0.1, 0.1, 0.2, 0.1, 0.8, 0.9, 0.1, 0.1]);

    let source = WavSource::open(&path, &config).unwrap();
    let pipeline = Pipeline::new(config, Box::new(source), Box::new(scorer)).unwrap();
    let mut handle = pipeline.start().unwrap();
    let counter = handle.counter();

    let mut events = Vec::new();
    while let Some(event) = handle.recv_event().await {
        events.push(event);
    }

    assert_eq!(events.len(), 2);
    assert_eq!(counter.snapshot(), events.len() as u64);

    let summary = handle.shutdown().await.unwrap();
    assert_eq!(summary.final_count, 2);
    assert_eq!(summary.stats.windows_scored, 10);
    assert_eq!(summary.stats.inference_failures, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_sustained_speech_counts_once_end_to_end() {
    let config = test_config();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sustained.wav");

    // 1000 samples: 4 full windows plus the padded tail.
    let audio = generate_tone(300.0, config.sample_rate, 1_000, 0.5);
    write_wav(&path, config.sample_rate, &audio);

    let (scorer, _) = ScriptedScorer::new(&[0.6, 0.9, 0.8, 0.7, 0.6]);

    let source = WavSource::open(&path, &config).unwrap();
    let pipeline = Pipeline::new(config, Box::new(source), Box::new(scorer)).unwrap();
    let mut handle = pipeline.start().unwrap();

    let mut events = 0;
    while handle.recv_event().await.is_some() {
        events += 1;
    }

    let summary = handle.shutdown().await.unwrap();
    assert_eq!(events, 1);
    assert_eq!(summary.final_count, 1);
}

#[tokio::test]
async fn test_silence_counts_nothing() {
    let config = test_config();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("silence.wav");

    write_wav(&path, config.sample_rate, &vec![0i16; 2_000]);

    let (scorer, _) = ScriptedScorer::new(&[]);

    let source = WavSource::open(&path, &config).unwrap();
    let pipeline = Pipeline::new(config, Box::new(source), Box::new(scorer)).unwrap();
    let mut handle = pipeline.start().unwrap();

    assert!(handle.recv_event().await.is_none());

    let summary = handle.shutdown().await.unwrap();
    assert_eq!(summary.final_count, 0);
    assert_eq!(summary.stats.windows_scored, 10);
}

#[tokio::test]
async fn test_padding_policy_controls_tail_window() {
    let dir = tempfile::tempdir().unwrap();

    // 1000 samples yield 4 full windows; the 200-sample tail is scored only
    // when padding is enabled.
    for (pad, expected_windows) in [(true, 5usize), (false, 4usize)] {
        let config = PipelineConfig {
            pad_final_window: pad,
            ..test_config()
        };
        let path = dir.path().join(format!("tail_{pad}.wav"));
        let audio = generate_tone(250.0, config.sample_rate, 1_000, 0.4);
        write_wav(&path, config.sample_rate, &audio);

        let (scorer, calls) = ScriptedScorer::new(&[]);
        let source = WavSource::open(&path, &config).unwrap();
        let pipeline = Pipeline::new(config, Box::new(source), Box::new(scorer)).unwrap();
        let mut handle = pipeline.start().unwrap();

        while handle.recv_event().await.is_some() {}
        handle.shutdown().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), expected_windows, "pad={pad}");
    }
}

/// Minimal LCG so the property loop is deterministic.
fn next_random(seed: &mut u64) -> u64 {
    *seed = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    *seed
}

#[test]
fn test_counter_equals_event_count_for_random_sequences() {
    let mut seed: u64 = 0x5eed_cafe;

    for _ in 0..200 {
        let refractory_strides = 1 + (next_random(&mut seed) % 4) as u32;
        let mut debouncer =
            DetectionDebouncer::new(0.5, Duration::from_millis(25) * refractory_strides).unwrap();
        let counter = WordCounter::new();
        let mut events = 0u64;

        for i in 0..60u32 {
            let probability = (next_random(&mut seed) >> 33) as f32 / (1u64 << 31) as f32;
            let score = DetectionScore {
                probability,
                at: Duration::from_millis(25) * i,
            };
            if let Some(event) = debouncer.update(score) {
                counter.on_event(&event);
                events += 1;
            }
        }

        assert_eq!(counter.snapshot(), events);
    }
}
