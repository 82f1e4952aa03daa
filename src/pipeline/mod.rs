// src/pipeline/mod.rs
//
// The staged worker graph:
//
//   Preprocess ──(every frame)──> Segment ──> Track
//       └──(every Nth frame)──> SaliencySample ──┘
//
// Four workers on their own threads, one-directional bounded channels
// between them, and a controller doing the INIT/START/EXIT/SHUTDOWN
// rendezvous. All cross-worker state transfer is by payload move; no
// worker shares mutable memory with another.

pub mod controller;
pub mod message;
pub mod metrics;
pub mod preprocess;
pub mod saliency_stage;
pub mod segment;
pub mod stage;
pub mod track_stage;

use crate::config::Config;
use crate::frame_source::FrameSource;
use crate::overlay::{DrawMode, OverlayOptions, OverlaySink};
use crate::recorder::EventRecorder;
use crate::saliency::TopIntensitySampler;
use crate::segmentation::{make_backend, DisinterestMask};
use anyhow::{Context, Result};
use controller::Controller;
use crossbeam_channel::bounded;
use metrics::PipelineMetrics;
use preprocess::PreprocessStage;
use saliency_stage::SaliencyStage;
use segment::SegmentStage;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use track_stage::TrackStage;

/// Wire up the fixed four-node graph for `source` and hand back the
/// controller that drives it.
pub fn build_pipeline(
    config: &Config,
    source: Box<dyn FrameSource>,
) -> Result<(Controller, Arc<PipelineMetrics>)> {
    let (width, height) = source.dims();
    let start_frame = source.start_frame();
    let last_frame = source.last_frame();
    let metrics = Arc::new(PipelineMetrics::new());

    let capacity = config.pipeline.channel_capacity.max(1);
    let (seg_tx, seg_rx) = bounded(capacity);
    let (sal_tx, sal_rx) = bounded(capacity);
    let (mask_tx, mask_rx) = bounded(capacity);
    let (cand_tx, cand_rx) = bounded(capacity);

    let mut controller = Controller::new();

    let preprocess = PreprocessStage::new(
        source,
        &config.cache,
        &config.saliency,
        seg_tx,
        sal_tx,
        metrics.clone(),
    );

    let segment = SegmentStage::new(
        make_backend(&config.detection),
        DisinterestMask::from_config(&config.detection, width, height)?,
        config.detection.cleanup_size,
        seg_rx,
        mask_tx,
        metrics.clone(),
    );

    let saliency = SaliencyStage::new(
        Box::new(TopIntensitySampler {
            intensity_floor: config.saliency.intensity_floor,
            min_separation: config.saliency.min_separation,
        }),
        config.saliency.max_events_per_sample,
        sal_rx,
        cand_tx,
        metrics.clone(),
    );

    let out_dir = PathBuf::from(&config.output.dir);
    let (events_out, summary_path) = if config.output.save_events {
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("creating output directory {}", out_dir.display()))?;
        let file = File::create(out_dir.join("events.jsonl")).context("creating event stream")?;
        let writer: Box<dyn Write + Send> = Box::new(BufWriter::new(file));
        (Some(writer), Some(out_dir.join("summary.json")))
    } else {
        (None, None)
    };
    let recorder = EventRecorder::new(
        events_out,
        config.output.retain_boring_events,
        config.detection.min_event_frames,
    );

    let overlay = if config.output.save_overlay {
        let sink = OverlaySink::new(
            out_dir
                .join("overlay")
                .to_str()
                .context("output directory path is not valid UTF-8")?,
        )?;
        let mode = match config.output.overlay_mode.as_str() {
            "shape" => DrawMode::Shape,
            "bbox" => DrawMode::BoundingBox,
            "none" => DrawMode::None,
            _ => DrawMode::Outline,
        };
        let options = OverlayOptions {
            mode,
            show_boring: config.output.retain_boring_events,
            min_event_frames: config.detection.min_event_frames,
            ..OverlayOptions::default()
        };
        Some((sink, options))
    } else {
        None
    };

    let track = TrackStage::new(
        config,
        start_frame,
        last_frame,
        recorder,
        summary_path,
        overlay,
        mask_rx,
        cand_rx,
        controller.reply_sender(),
        metrics.clone(),
    );

    controller.add_stage(Box::new(preprocess));
    controller.add_stage(Box::new(segment));
    controller.add_stage(Box::new(saliency));
    controller.add_stage(Box::new(track));

    Ok((controller, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_source::SyntheticSource;
    use crate::types::RgbFrame;
    use std::sync::atomic::Ordering;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("deepwatch-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    /// 96x64 black frames with a bright 10x10 square translating
    /// 2 px/frame from (20, 20), visible for frames [appear, vanish).
    fn square_sequence(total: u32, appear: u32, vanish: u32) -> Vec<RgbFrame> {
        (0..total)
            .map(|f| {
                let mut rgb = RgbFrame::filled(96, 64, [0, 0, 0]);
                if f >= appear && f < vanish {
                    let left = 20 + 2 * (f - appear) as usize;
                    for y in 20..30 {
                        for x in left..left + 10 {
                            rgb.set_pixel(x, y, [255, 255, 255]);
                        }
                    }
                }
                rgb
            })
            .collect()
    }

    fn scenario_config(out_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.cache.size = 30;
        config.detection.min_event_area = 50;
        config.detection.max_event_area = 1000;
        config.detection.min_event_frames = 5;
        config.detection.expiration_frames = 0;
        config.detection.max_acceleration = 0.0;
        config.saliency.stride = 5;
        config.output.dir = out_dir.to_string_lossy().into_owned();
        config.output.save_events = true;
        config.output.retain_boring_events = false;
        config
    }

    #[test]
    fn test_end_to_end_single_moving_square() {
        let dir = test_dir("e2e");
        let config = scenario_config(&dir);

        // square appears at frame 10, disappears at frame 30
        let source = SyntheticSource::new(square_sequence(50, 10, 30), 0, 30.0);
        let (controller, metrics) = build_pipeline(&config, Box::new(source)).unwrap();
        controller.run().unwrap();

        assert_eq!(metrics.frames_tracked.load(Ordering::Relaxed), 50);
        assert_eq!(metrics.events_recorded.load(Ordering::Relaxed), 1);

        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["total_events"], 1);
        let event = &summary["events"][0];
        assert_eq!(event["start_frame"], 10);
        assert_eq!(event["end_frame"], 29);
        assert_eq!(event["max_area"], 100);
        assert_eq!(event["category"], "Interesting");

        // the event stream carries the same record
        let events = std::fs::read_to_string(dir.join("events.jsonl")).unwrap();
        assert_eq!(events.lines().count(), 1);
        let record: serde_json::Value = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(record["start_frame"], 10);
        assert_eq!(record["end_frame"], 29);
        assert_eq!(record["centroid_history"].as_array().unwrap().len(), 20);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_handshake_completes_on_eventless_stream() {
        let dir = test_dir("handshake");
        let mut config = scenario_config(&dir);
        config.cache.size = 2;

        let source = SyntheticSource::new(square_sequence(6, 99, 99), 0, 30.0);
        let (controller, metrics) = build_pipeline(&config, Box::new(source)).unwrap();
        controller.run().unwrap();

        assert_eq!(metrics.frames_tracked.load(Ordering::Relaxed), 6);
        assert_eq!(metrics.events_recorded.load(Ordering::Relaxed), 0);
        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary["total_events"], 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_short_stream_is_recoverable() {
        // stream shorter than the cache: preload warns and the run still
        // completes cleanly
        let dir = test_dir("short");
        let mut config = scenario_config(&dir);
        config.cache.size = 30;
        config.output.save_events = false;

        let source = SyntheticSource::new(square_sequence(4, 99, 99), 0, 30.0);
        let (controller, metrics) = build_pipeline(&config, Box::new(source)).unwrap();
        controller.run().unwrap();
        assert_eq!(metrics.frames_tracked.load(Ordering::Relaxed), 4);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
