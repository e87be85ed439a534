/// Keyword counting service binary
///
/// Listens to the microphone (or replays a WAV recording) and prints the
/// running count each time the target word is detected.

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber;
use wordspot::{AudioSource, MicSource, OnnxEngine, Pipeline, PipelineConfig, WavSource};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wordspot=info".parse().unwrap()),
        )
        .init();

    info!("Starting wordspot keyword counting service");

    // Load configuration
    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {e:#}");
            std::process::exit(1);
        }
    };

    // Load the model once, up front
    let engine = match OnnxEngine::load(&config.model_path, config.window_length) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to load keyword model: {e}");
            std::process::exit(1);
        }
    };

    // Open the audio source
    let source: Box<dyn AudioSource> = match std::env::var("WORDSPOT_INPUT_WAV") {
        Ok(path) => match WavSource::open(Path::new(&path), &config) {
            Ok(source) => Box::new(source),
            Err(e) => {
                error!("Failed to open input recording: {e}");
                std::process::exit(1);
            }
        },
        Err(_) => match MicSource::open(&config) {
            Ok(source) => Box::new(source),
            Err(e) => {
                error!("Failed to open audio device: {e}");
                std::process::exit(1);
            }
        },
    };

    let pipeline = match Pipeline::new(config, source, Box::new(engine)) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to create pipeline: {e}");
            std::process::exit(1);
        }
    };

    let mut handle = match pipeline.start() {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start pipeline: {e}");
            std::process::exit(1);
        }
    };

    let counter = handle.counter();
    info!("Listening for the target word...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stop signal received, shutting down");
                break;
            }
            event = handle.recv_event() => match event {
                Some(_) => println!("Word recognized! Count: {}", counter.snapshot()),
                None => {
                    info!("Audio stream finished");
                    break;
                }
            }
        }
    }

    match handle.shutdown().await {
        Ok(summary) => {
            println!("Final count: {}", summary.final_count);
        }
        Err(e) => {
            error!("Pipeline terminated with error: {e}");
            std::process::exit(1);
        }
    }
}

/// Load configuration from the environment, optionally starting from a JSON
/// file named by WORDSPOT_CONFIG. Environment variables override file values.
fn load_config() -> anyhow::Result<PipelineConfig> {
    let mut config = match std::env::var("WORDSPOT_CONFIG") {
        Ok(path) => PipelineConfig::from_json_file(Path::new(&path))
            .with_context(|| format!("loading config file {path}"))?,
        Err(_) => PipelineConfig::default(),
    };

    if let Ok(path) = std::env::var("WORDSPOT_MODEL_PATH") {
        config.model_path = PathBuf::from(path);
    }

    if let Ok(rate) = std::env::var("WORDSPOT_SAMPLE_RATE") {
        config.sample_rate = rate
            .parse()
            .context("WORDSPOT_SAMPLE_RATE must be an integer")?;
    }

    if let Ok(threshold) = std::env::var("WORDSPOT_THRESHOLD") {
        config.threshold = threshold
            .parse()
            .context("WORDSPOT_THRESHOLD must be a float")?;
    }

    if let Ok(ms) = std::env::var("WORDSPOT_REFRACTORY_MS") {
        let ms: u64 = ms
            .parse()
            .context("WORDSPOT_REFRACTORY_MS must be an integer")?;
        config.refractory_period = std::time::Duration::from_millis(ms);
    }

    if let Ok(window) = std::env::var("WORDSPOT_WINDOW_LENGTH") {
        config.window_length = window
            .parse()
            .context("WORDSPOT_WINDOW_LENGTH must be an integer")?;
    }

    if let Ok(stride) = std::env::var("WORDSPOT_STRIDE") {
        config.stride = stride
            .parse()
            .context("WORDSPOT_STRIDE must be an integer")?;
    }

    config.validate()?;
    Ok(config)
}
