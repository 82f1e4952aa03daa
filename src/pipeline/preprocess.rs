// src/pipeline/preprocess.rs
//
// First worker of the graph. Maintains the running-average frame cache,
// forwards every frame (with a background-model snapshot) to the
// segmentation stage, and every `saliency_stride`-th difference image to
// the saliency stage.

use super::message::{Envelope, FrameData, Payload, StageId};
use super::metrics::PipelineMetrics;
use super::stage::{Stage, StageContext};
use crate::config::{CacheConfig, SaliencyConfig};
use crate::frame_cache::FrameCache;
use crate::frame_source::{FrameSource, SourceError, SourcedFrame};
use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PreprocessStage {
    source: Box<dyn FrameSource>,
    cache: FrameCache,
    min_std_dev: f32,
    saliency_stride: u32,
    to_segment: Sender<Envelope>,
    to_saliency: Sender<Envelope>,
    /// Frames pulled in during preload, replayed before reading more.
    pending: VecDeque<SourcedFrame>,
    metrics: Arc<PipelineMetrics>,
}

impl PreprocessStage {
    pub fn new(
        source: Box<dyn FrameSource>,
        cache_cfg: &CacheConfig,
        saliency_cfg: &SaliencyConfig,
        to_segment: Sender<Envelope>,
        to_saliency: Sender<Envelope>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            source,
            cache: FrameCache::new(cache_cfg.size),
            min_std_dev: cache_cfg.min_std_dev,
            saliency_stride: saliency_cfg.stride.max(1),
            to_segment,
            to_saliency,
            pending: VecDeque::new(),
            metrics,
        }
    }
}

impl Stage for PreprocessStage {
    fn id(&self) -> StageId {
        StageId::Preprocess
    }

    /// Pre-fill the cache so the very first processed frame already has
    /// a meaningful background model. A stream shorter than the cache is
    /// recoverable: use what is there and warn.
    fn init(&mut self) -> Result<()> {
        while self.cache.len() < self.cache.capacity() {
            match self.source.read_next() {
                Ok(frame) => {
                    let kept = self
                        .cache
                        .admit(frame.rgb.to_gray(), self.min_std_dev)
                        .context("preloading frame cache")?;
                    if !kept {
                        self.metrics.inc(&self.metrics.degenerate_frames);
                    }
                    debug!(frame = frame.frame_number, "cached frame");
                    self.pending.push_back(frame);
                }
                Err(SourceError::EndOfStream) => {
                    warn!(
                        cached = self.cache.len(),
                        capacity = self.cache.capacity(),
                        "fewer input frames than the sliding average needs, using all of them"
                    );
                    break;
                }
                Err(SourceError::Other(err)) => return Err(err.context("preloading frames")),
            }
        }
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext) -> Result<()> {
        let mut countdown = 1u32;
        let mut last_sent = 0u32;

        loop {
            // preloaded frames are already in the cache; fresh ones are
            // admitted here before the diff is taken
            let (frame, preloaded) = match self.pending.pop_front() {
                Some(frame) => (frame, true),
                None => match self.source.read_next() {
                    Ok(frame) => (frame, false),
                    Err(SourceError::EndOfStream) => break,
                    Err(SourceError::Other(err)) => return Err(err.context("reading frame")),
                },
            };

            let gray = frame.rgb.to_gray();
            if !preloaded {
                let kept = self.cache.admit(gray.clone(), self.min_std_dev)?;
                if !kept {
                    self.metrics.inc(&self.metrics.degenerate_frames);
                }
            }

            let background = self
                .cache
                .mean()
                .context("frame cache empty after admit")?;
            let saliency_input = self.cache.clamped_diff_from_mean(&gray)?;

            let envelope = Envelope {
                frame_number: frame.frame_number,
                from: StageId::Preprocess,
                payload: Payload::Frame(FrameData {
                    gray,
                    background: Some(background),
                    rgb: Some(frame.rgb),
                    timecode: frame.timecode,
                }),
            };
            if !ctx.send(&self.to_segment, envelope) {
                return Ok(()); // interrupted by EXIT
            }

            countdown -= 1;
            if countdown == 0 {
                countdown = self.saliency_stride;
                let envelope = Envelope {
                    frame_number: frame.frame_number,
                    from: StageId::Preprocess,
                    payload: Payload::Frame(FrameData {
                        gray: saliency_input,
                        background: None,
                        rgb: None,
                        timecode: None,
                    }),
                };
                if !ctx.send(&self.to_saliency, envelope) {
                    return Ok(());
                }
            }

            self.metrics.inc(&self.metrics.frames_preprocessed);
            last_sent = frame.frame_number;
        }

        // input exhausted before the declared last frame: tell the
        // downstream chain so the run can finish cleanly
        debug!(last_sent, "input exhausted, signalling stream end");
        ctx.send(
            &self.to_segment,
            Envelope {
                frame_number: last_sent,
                from: StageId::Preprocess,
                payload: Payload::StreamEnd,
            },
        );
        Ok(())
    }
}
