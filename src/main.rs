// src/main.rs

mod config;
mod drift;
mod error;
mod frame_cache;
mod frame_source;
mod kalman;
mod overlay;
mod pipeline;
mod recorder;
mod region;
mod saliency;
mod segmentation;
mod track;
mod track_set;
mod types;

use anyhow::Result;
use config::Config;
use frame_source::ImageSequenceSource;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("deepwatch={}", config.logging.level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("deepwatch event detection starting");
    if !Path::new(&config_path).exists() {
        warn!(path = %config_path, "config file not found, using defaults");
    }
    info!(
        mode = ?config.detection.tracking_mode,
        max_dist = config.detection.max_dist,
        saliency_stride = config.saliency.stride,
        cache = config.cache.size,
        "detection parameters"
    );

    let source = ImageSequenceSource::open(
        &config.input.frame_dir,
        config.input.start_frame,
        config.input.last_frame,
        config.input.fps,
    )?;

    let (controller, metrics) = pipeline::build_pipeline(&config, Box::new(source))?;
    controller.run()?;

    let summary = metrics.summary();
    info!(
        frames = summary.frames_tracked,
        events = summary.events_recorded,
        rendered = summary.frames_rendered,
        fps = summary.fps,
        elapsed_secs = summary.elapsed_secs,
        "run complete"
    );
    Ok(())
}
