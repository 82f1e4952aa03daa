// src/pipeline/track_stage.rs
//
// Final worker of the graph: owns the TrackSet, the drift estimator and
// the recorder, and joins the two unequal-rate input streams.
//
// Masks arrive at full frame rate and drive association immediately, in
// arrival order. Candidate lists arrive only for every
// `saliency_stride`-th frame and may lag; seeding for a frame happens
// once both its mask and its candidate list are in. Frames stay pending
// (unrendered, unrecorded) only until their seeding is resolved, so the
// per-frame tracking latency is decoupled from the slower nomination
// cadence while the output stream stays deterministic and in order.

use super::message::{ControlReply, Envelope, MaskData, Payload, StageId};
use super::metrics::PipelineMetrics;
use super::stage::{Stage, StageContext};
use crate::config::Config;
use crate::drift::{DriftConfig, DriftEstimator};
use crate::error::CoreError;
use crate::overlay::{render_tokens, OverlayOptions, OverlaySink};
use crate::recorder::EventRecorder;
use crate::saliency::Candidate;
use crate::track_set::TrackSet;
use crate::types::{GrayFrame, Point, RgbFrame};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{never, select, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// A mask frame buffered until its seeding is resolved and its output
/// flushed.
struct PendingFrame {
    frame_number: u32,
    mask: GrayFrame,
    /// Grayscale of the raw frame, for intensity statistics.
    gray: Option<GrayFrame>,
    rgb: Option<RgbFrame>,
    timecode: Option<String>,
}

pub struct TrackStage {
    set: TrackSet,
    drift: DriftEstimator,
    recorder: Option<EventRecorder>,
    summary_path: Option<PathBuf>,
    overlay: Option<(OverlaySink, OverlayOptions)>,
    from_segment: Receiver<Envelope>,
    from_saliency: Receiver<Envelope>,
    reply_tx: Sender<ControlReply>,
    start_frame: u32,
    last_frame: u32,
    stride: u32,
    /// Per-stream sequence counter; a mismatch is fatal desync.
    expected_frame: u32,
    /// Next frame number seeding is due for.
    next_seed_frame: u32,
    /// Candidate lists keyed by frame number, until consumed.
    seeds: HashMap<u32, Vec<Candidate>>,
    pending: VecDeque<PendingFrame>,
    finished: bool,
    metrics: Arc<PipelineMetrics>,
}

impl TrackStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        start_frame: u32,
        last_frame: u32,
        recorder: EventRecorder,
        summary_path: Option<PathBuf>,
        overlay: Option<(OverlaySink, OverlayOptions)>,
        from_segment: Receiver<Envelope>,
        from_saliency: Receiver<Envelope>,
        reply_tx: Sender<ControlReply>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let stride = config.saliency.stride;
        Self {
            set: TrackSet::new(config.detection.clone()),
            drift: DriftEstimator::new(DriftConfig::default()),
            recorder: Some(recorder),
            summary_path,
            overlay,
            from_segment,
            from_saliency,
            reply_tx,
            start_frame,
            last_frame,
            stride: stride.max(1),
            expected_frame: start_frame,
            next_seed_frame: start_frame,
            seeds: HashMap::new(),
            pending: VecDeque::new(),
            finished: false,
            metrics,
        }
    }

    /// Association for one incoming mask; returns true when this was the
    /// declared last frame.
    fn handle_mask(&mut self, frame_number: u32, data: MaskData) -> Result<bool> {
        if frame_number != self.expected_frame {
            return Err(CoreError::StreamDesync {
                stage: "track",
                expected: self.expected_frame,
                received: frame_number,
            }
            .into());
        }
        self.expected_frame += 1;

        let drift = self.drift.update(&data.mask);
        let gray = data.rgb.as_ref().map(|rgb| rgb.to_gray());
        self.set.update_events(
            &data.mask,
            frame_number,
            drift,
            data.timecode.as_deref(),
            gray.as_ref(),
        );
        self.metrics.inc(&self.metrics.frames_tracked);

        self.pending.push_back(PendingFrame {
            frame_number,
            mask: data.mask,
            gray,
            rgb: data.rgb,
            timecode: data.timecode,
        });

        self.advance_seeds()?;
        if frame_number == self.last_frame {
            return Ok(true);
        }
        self.flush()?;
        Ok(false)
    }

    fn handle_candidates(&mut self, frame_number: u32, candidates: Vec<Candidate>) -> Result<()> {
        debug!(
            frame = frame_number,
            n = candidates.len(),
            "candidate list buffered"
        );
        self.seeds.insert(frame_number, candidates);
        self.advance_seeds()?;
        self.flush()
    }

    /// Consume candidate lists in seed order. Seeding for a frame runs
    /// only once its mask is here; an empty list advances the seed
    /// pointer by the stride without stalling anything.
    fn advance_seeds(&mut self) -> Result<()> {
        while let Some(newest) = self.pending.back().map(|p| p.frame_number) {
            if self.next_seed_frame > newest {
                break;
            }
            let Some(candidates) = self.seeds.remove(&self.next_seed_frame) else {
                break; // list not here yet; association keeps going regardless
            };
            if !candidates.is_empty() {
                let seed_frame = self.next_seed_frame;
                let frame = self
                    .pending
                    .iter()
                    .find(|p| p.frame_number == seed_frame);
                if let Some(pf) = frame {
                    let points: Vec<Point> = candidates.iter().map(|c| c.point).collect();
                    let scores: Vec<f32> = candidates.iter().map(|c| c.strength).collect();
                    self.set
                        .seed_from_points(
                            &pf.mask,
                            &points,
                            &scores,
                            pf.frame_number,
                            pf.timecode.as_deref(),
                            pf.gray.as_ref(),
                        )
                        .with_context(|| format!("seeding events at frame {seed_frame}"))?;
                }
            }
            self.next_seed_frame = self.next_seed_frame.saturating_add(self.stride);
        }
        Ok(())
    }

    /// Emit output for every pending frame whose seeding is resolved:
    /// overlay render, closed-event records, lifecycle sweep.
    fn flush(&mut self) -> Result<()> {
        while self
            .pending
            .front()
            .map_or(false, |p| p.frame_number < self.next_seed_frame)
        {
            // unwrap is safe: the loop condition just saw a front
            let pf = self.pending.pop_front().unwrap();

            if let Some((sink, options)) = &self.overlay {
                if let Some(rgb) = &pf.rgb {
                    let mut canvas = rgb.clone();
                    let tracks = self.set.events_for_frame(pf.frame_number);
                    render_tokens(&mut canvas, &tracks, pf.frame_number, options);
                    sink.save(&canvas, pf.frame_number)
                        .with_context(|| format!("rendering frame {}", pf.frame_number))?;
                    self.metrics.inc(&self.metrics.frames_rendered);
                }
            }

            self.record_ready()
                .with_context(|| format!("recording events at frame {}", pf.frame_number))?;
            self.set.clean_up(pf.frame_number);
        }
        Ok(())
    }

    fn record_ready(&mut self) -> Result<()> {
        let Some(recorder) = self.recorder.as_mut() else {
            return Ok(());
        };
        let before = recorder.records_written();
        for id in self.set.ready_to_save_ids() {
            if let Some(track) = self.set.get_mut(id) {
                recorder.record(track)?;
                track.flag_write_complete();
                track.flag_for_delete();
            }
        }
        let written = recorder.records_written() - before;
        if written > 0 {
            self.metrics.add(&self.metrics.events_recorded, written);
        }
        Ok(())
    }

    /// End of stream: close everything, flush all pending output, write
    /// the run summary and signal the controller.
    fn finalize(&mut self) -> Result<()> {
        info!(
            frame = self.expected_frame.saturating_sub(1),
            events = self.set.num_events(),
            avg_speed = self.set.average_speed(),
            "stream complete, closing all events"
        );
        self.advance_seeds()?;
        self.set.close_all();
        self.next_seed_frame = u32::MAX;
        self.flush()?;
        self.record_ready()?;

        if let Some(recorder) = self.recorder.take() {
            let start = self.set.start_frame().unwrap_or(self.start_frame);
            let end = self.set.end_frame().unwrap_or(self.last_frame);
            let summary = recorder.finish(self.set.params(), start, end)?;
            if let Some(path) = &self.summary_path {
                let file = File::create(path)
                    .with_context(|| format!("creating summary {}", path.display()))?;
                serde_json::to_writer_pretty(file, &summary).context("writing run summary")?;
                info!(
                    path = %path.display(),
                    events = summary.total_events,
                    "run summary written"
                );
            } else {
                info!(events = summary.total_events, "run finished");
            }
        }

        self.finished = true;
        let _ = self.reply_tx.send(ControlReply::StreamDone);
        Ok(())
    }
}

impl Stage for TrackStage {
    fn id(&self) -> StageId {
        StageId::Track
    }

    fn run(&mut self, ctx: &StageContext) -> Result<()> {
        let mut seg_rx = self.from_segment.clone();
        let mut sal_rx = self.from_saliency.clone();

        while !self.finished {
            let mut envelope = None;
            let mut seg_gone = false;
            let mut sal_gone = false;
            select! {
                recv(ctx.control_rx) -> msg => match msg {
                    Ok(msg) => {
                        if ctx.note_control(msg) {
                            return Ok(());
                        }
                    }
                    Err(_) => return Ok(()),
                },
                recv(seg_rx) -> env => match env {
                    Ok(env) => envelope = Some(env),
                    Err(_) => seg_gone = true,
                },
                recv(sal_rx) -> env => match env {
                    Ok(env) => envelope = Some(env),
                    Err(_) => sal_gone = true,
                },
            }
            // a disconnected upstream (teardown) must not busy-loop
            if seg_gone {
                seg_rx = never();
            }
            if sal_gone {
                sal_rx = never();
            }
            let Some(envelope) = envelope else {
                continue;
            };

            let frame_number = envelope.frame_number;
            let sender = envelope.from;
            match envelope.payload {
                Payload::Mask(data) => {
                    let done = self
                        .handle_mask(frame_number, data)
                        .with_context(|| format!("frame {frame_number} in track stage"))?;
                    if done {
                        self.finalize()?;
                    }
                }
                Payload::Candidates(candidates) => {
                    self.handle_candidates(frame_number, candidates)?;
                }
                Payload::StreamEnd => {
                    self.finalize()?;
                }
                other => bail!(
                    "track stage received unexpected {} payload from {sender} at frame {frame_number}",
                    other.kind()
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crossbeam_channel::{bounded, unbounded};

    fn mask_with_square(left: i32, top: i32, size: i32) -> GrayFrame {
        let mut img = GrayFrame::zeros(64, 64);
        for y in top..top + size {
            for x in left..left + size {
                if x >= 0 && y >= 0 && x < 64 && y < 64 {
                    img.set_pixel(x as usize, y as usize, 255);
                }
            }
        }
        img
    }

    fn make_stage(stride: u32, last_frame: u32) -> (TrackStage, Receiver<ControlReply>) {
        let mut config = Config::default();
        config.saliency.stride = stride;
        config.detection.min_event_area = 10;
        config.detection.max_event_area = 1000;
        config.detection.min_event_frames = 3;
        config.detection.expiration_frames = 1;
        let (reply_tx, reply_rx) = unbounded();
        let (_seg_tx, seg_rx) = bounded(8);
        let (_sal_tx, sal_rx) = bounded(8);
        let recorder = EventRecorder::new(None, true, config.detection.min_event_frames);
        let stage = TrackStage::new(
            &config,
            0,
            last_frame,
            recorder,
            None,
            None,
            seg_rx,
            sal_rx,
            reply_tx,
            Arc::new(PipelineMetrics::new()),
        );
        (stage, reply_rx)
    }

    fn mask_data(mask: GrayFrame) -> MaskData {
        MaskData {
            mask,
            rgb: None,
            timecode: None,
        }
    }

    #[test]
    fn test_join_scenario_empty_then_seeded() {
        // stride 5: seed frames are 0, 5, 10. Frames 0..=4 empty, a blob
        // appears at frame 5 but its candidate list is empty; the list
        // for frame 10 carries one point inside the moving blob.
        let (mut stage, _rx) = make_stage(5, 20);

        stage.handle_candidates(0, vec![]).unwrap();
        for f in 0..=4u32 {
            let done = stage.handle_mask(f, mask_data(GrayFrame::zeros(64, 64))).unwrap();
            assert!(!done);
            assert!(stage.set.is_empty());
        }

        // empty candidate list for seed frame 5: no seeding, no stall
        stage.handle_candidates(5, vec![]).unwrap();
        for f in 5..=9u32 {
            let blob = mask_with_square(10 + 2 * (f as i32 - 5), 20, 8);
            stage.handle_mask(f, mask_data(blob)).unwrap();
            // association runs against zero tracks without crashing
            assert!(stage.set.is_empty(), "no track before frame 10");
        }

        let blob10 = mask_with_square(20, 20, 8);
        stage.handle_mask(10, mask_data(blob10)).unwrap();
        assert!(stage.set.is_empty(), "seeding waits for the candidate list");

        stage
            .handle_candidates(10, vec![Candidate {
                point: Point::new(23, 23),
                strength: 0.8,
            }])
            .unwrap();
        assert_eq!(stage.set.num_events(), 1);
        let track = stage.set.iter().next().unwrap();
        assert_eq!(track.start_frame(), 10);

        // association keeps extending the seeded track
        for f in 11..=13u32 {
            let blob = mask_with_square(20 + 2 * (f as i32 - 10), 20, 8);
            stage.handle_mask(f, mask_data(blob)).unwrap();
        }
        let track = stage.set.iter().next().unwrap();
        assert_eq!(track.valid_end_frame(), 13);
    }

    #[test]
    fn test_seeding_deferred_until_candidates_arrive() {
        // candidates for seed frame 0 arrive after masks 0..=3 have all
        // been associated; the seed still lands on frame 0's mask
        let (mut stage, _rx) = make_stage(5, 20);
        for f in 0..=3u32 {
            stage
                .handle_mask(f, mask_data(mask_with_square(30, 30, 8)))
                .unwrap();
        }
        assert!(stage.set.is_empty());
        assert_eq!(stage.pending.len(), 4, "frames wait for seed resolution");

        stage
            .handle_candidates(0, vec![Candidate {
                point: Point::new(33, 33),
                strength: 0.6,
            }])
            .unwrap();
        assert_eq!(stage.set.num_events(), 1);
        assert_eq!(stage.set.iter().next().unwrap().start_frame(), 0);
        // frames below the advanced seed pointer have been flushed
        assert!(stage.pending.len() <= 1);
    }

    #[test]
    fn test_desync_is_fatal() {
        let (mut stage, _rx) = make_stage(5, 20);
        stage
            .handle_mask(0, mask_data(GrayFrame::zeros(64, 64)))
            .unwrap();
        let err = stage
            .handle_mask(2, mask_data(GrayFrame::zeros(64, 64)))
            .unwrap_err();
        let core = err.downcast_ref::<CoreError>().unwrap();
        assert!(matches!(core, CoreError::StreamDesync { .. }));
        assert!(core.is_fatal());
    }

    #[test]
    fn test_finalize_closes_and_signals() {
        let (mut stage, reply_rx) = make_stage(5, 6);
        stage
            .handle_candidates(0, vec![Candidate {
                point: Point::new(13, 13),
                strength: 0.7,
            }])
            .unwrap();
        let mut done = false;
        for f in 0..=6u32 {
            let blob = mask_with_square(10 + f as i32, 10, 8);
            done = stage.handle_mask(f, mask_data(blob)).unwrap();
            // later seed frames never get lists; association continues
            if f == 5 {
                stage.handle_candidates(5, vec![]).unwrap();
            }
        }
        assert!(done, "last frame must end the stream");
        stage.finalize().unwrap();

        assert!(stage.finished);
        assert!(matches!(reply_rx.try_recv(), Ok(ControlReply::StreamDone)));
        // everything closed and swept
        assert!(stage.pending.is_empty());
        assert!(stage.set.iter().all(|t| !t.is_open()));
    }
}
