// src/config.rs
//
// Runtime configuration, loaded from a single YAML document. Every
// section has full defaults so a partial file (or none at all) still
// yields a working setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub cache: CacheConfig,
    pub detection: DetectionConfig,
    pub saliency: SaliencyConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config file {path}"))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Directory of numbered frame images (png/jpg).
    pub frame_dir: String,
    /// First frame number of the run.
    pub start_frame: u32,
    /// Last frame to process; `None` means the whole sequence.
    pub last_frame: Option<u32>,
    /// Nominal frame rate, used only to synthesize timecode strings.
    pub fps: f32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            frame_dir: "frames".to_string(),
            start_frame: 0,
            last_frame: None,
            fps: 29.97,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of frames in the running-average cache.
    pub size: usize,
    /// Frames with intensity std-dev at or below this are treated as
    /// degenerate (all-black/corrupt) and replaced by the cache mean.
    /// 0 disables the check.
    pub min_std_dev: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 10,
            min_std_dev: 0.0,
        }
    }
}

/// Association strategy applied to every open track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    Kalman,
    NearestNeighbor,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub tracking_mode: TrackingMode,
    /// Half-width in pixels of the square search window around the
    /// predicted location; also the slack allowed for out-of-bounds
    /// predictions before a track is force-closed.
    pub max_dist: i32,
    /// Maximum association cost for a candidate to be accepted.
    pub max_cost: f32,
    /// Area bounds for candidate regions.
    pub min_event_area: u32,
    pub max_event_area: u32,
    /// Events spanning at least this many frames are INTERESTING.
    pub min_event_frames: u32,
    /// Open events are force-closed past this span; 0 = unlimited.
    pub max_event_frames: u32,
    /// Grace period (frames) a track may go unmatched before closing.
    pub expiration_frames: u32,
    /// Per-frame acceleration magnitude above this closes the track as a
    /// tracking failure; 0 disables the check.
    pub max_acceleration: f32,
    /// Kalman filter noise parameters, shared by the x and y filters.
    pub kalman_process_noise: f32,
    pub kalman_measurement_noise: f32,
    /// Segmentation backend: "mean" or "median" adaptive threshold.
    pub segmenter: String,
    /// Threshold offset above the local tile statistic.
    pub segment_offset: i32,
    /// Tile edge length for the adaptive threshold.
    pub segment_block_size: usize,
    /// Structuring-element size for the morphological mask cleanup;
    /// 0 disables.
    pub cleanup_size: u32,
    /// Region of interest: only pixels inside this rect are segmented.
    pub mask_rect: Option<[i32; 4]>,
    /// Alternatively, a binary mask image file; nonzero = of interest.
    pub mask_image: Option<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tracking_mode: TrackingMode::Kalman,
            max_dist: 30,
            max_cost: 30.0,
            min_event_area: 20,
            max_event_area: 5000,
            min_event_frames: 5,
            max_event_frames: 0,
            expiration_frames: 2,
            max_acceleration: 7.0,
            kalman_process_noise: 0.1,
            kalman_measurement_noise: 2.0,
            segmenter: "mean".to_string(),
            segment_offset: 7,
            segment_block_size: 16,
            cleanup_size: 2,
            mask_rect: None,
            mask_image: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    /// Frame interval between candidate-nomination samples.
    pub stride: u32,
    /// Maximum candidate points returned per sample.
    pub max_events_per_sample: usize,
    /// Intensity floor below which nothing is considered salient.
    pub intensity_floor: u8,
    /// Minimum pixel separation between returned candidates.
    pub min_separation: u32,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            stride: 5,
            max_events_per_sample: 20,
            intensity_floor: 25,
            min_separation: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded capacity of each inter-stage data channel. Senders block
    /// when full; this is the pipeline's only flow control.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: String,
    /// Write annotated overlay frames.
    pub save_overlay: bool,
    /// How events are drawn: "shape", "outline", "bbox" or "none".
    pub overlay_mode: String,
    /// Write the per-event record stream and run summary.
    pub save_events: bool,
    /// Also record BORING events (too few frames to be interesting).
    pub retain_boring_events: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: "out".to_string(),
            save_overlay: false,
            overlay_mode: "outline".to_string(),
            save_events: true,
            retain_boring_events: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.size, 10);
        assert_eq!(cfg.detection.tracking_mode, TrackingMode::Kalman);
        assert_eq!(cfg.saliency.stride, 5);
        assert!(cfg.pipeline.channel_capacity > 0);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "detection:\n  tracking_mode: nearest_neighbor\n  max_dist: 50\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.detection.tracking_mode, TrackingMode::NearestNeighbor);
        assert_eq!(cfg.detection.max_dist, 50);
        // untouched sections keep their defaults
        assert_eq!(cfg.detection.max_cost, 30.0);
        assert_eq!(cfg.cache.size, 10);
    }

    #[test]
    fn test_round_trip() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.detection.max_dist, cfg.detection.max_dist);
        assert_eq!(back.saliency.max_events_per_sample, cfg.saliency.max_events_per_sample);
    }
}
