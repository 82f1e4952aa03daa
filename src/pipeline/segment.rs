// src/pipeline/segment.rs
//
// Segmentation worker: backend call, morphological cleanup,
// region-of-disinterest gating, then on to the track stage. Checks the
// per-stream ordering guarantee on every envelope.

use super::message::{Envelope, MaskData, Payload, StageId};
use super::metrics::PipelineMetrics;
use super::stage::{Stage, StageContext, Step};
use crate::error::CoreError;
use crate::segmentation::{cleanup_mask, DisinterestMask, SegmentationBackend};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use tracing::debug;

pub struct SegmentStage {
    backend: Box<dyn SegmentationBackend>,
    disinterest: Option<DisinterestMask>,
    cleanup_size: u32,
    from_preprocess: Receiver<Envelope>,
    to_track: Sender<Envelope>,
    expected_frame: Option<u32>,
    metrics: Arc<PipelineMetrics>,
}

impl SegmentStage {
    pub fn new(
        backend: Box<dyn SegmentationBackend>,
        disinterest: Option<DisinterestMask>,
        cleanup_size: u32,
        from_preprocess: Receiver<Envelope>,
        to_track: Sender<Envelope>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            backend,
            disinterest,
            cleanup_size,
            from_preprocess,
            to_track,
            expected_frame: None,
            metrics,
        }
    }
}

impl Stage for SegmentStage {
    fn id(&self) -> StageId {
        StageId::Segment
    }

    fn run(&mut self, ctx: &StageContext) -> Result<()> {
        loop {
            let envelope = match ctx.recv(&self.from_preprocess) {
                Step::Data(env) => env,
                Step::Exit | Step::Disconnected => return Ok(()),
            };
            let frame_number = envelope.frame_number;
            let sender = envelope.from;

            let data = match envelope.payload {
                Payload::Frame(data) => data,
                Payload::StreamEnd => {
                    // propagate and stop: nothing else will arrive
                    ctx.send(
                        &self.to_track,
                        Envelope {
                            frame_number,
                            from: StageId::Segment,
                            payload: Payload::StreamEnd,
                        },
                    );
                    return Ok(());
                }
                other => bail!(
                    "segment stage received unexpected {} payload from {sender} at frame {frame_number}",
                    other.kind()
                ),
            };

            if let Some(expected) = self.expected_frame {
                if frame_number != expected {
                    return Err(CoreError::StreamDesync {
                        stage: "segment",
                        expected,
                        received: frame_number,
                    }
                    .into());
                }
            }
            self.expected_frame = Some(frame_number + 1);

            let background = data
                .background
                .with_context(|| format!("frame {frame_number} arrived without a background model"))?;
            let mut mask = self
                .backend
                .segment(&data.gray, &background)
                .with_context(|| format!("segmenting frame {frame_number}"))?;
            mask = cleanup_mask(&mask, self.cleanup_size);
            if let Some(gate) = &self.disinterest {
                gate.apply(&mut mask);
            }
            debug!(
                frame = frame_number,
                backend = self.backend.name(),
                "mask ready"
            );

            let envelope = Envelope {
                frame_number,
                from: StageId::Segment,
                payload: Payload::Mask(MaskData {
                    mask,
                    rgb: data.rgb,
                    timecode: data.timecode,
                }),
            };
            if !ctx.send(&self.to_track, envelope) {
                return Ok(());
            }
            self.metrics.inc(&self.metrics.masks_segmented);
        }
    }
}
