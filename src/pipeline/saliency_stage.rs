// src/pipeline/saliency_stage.rs
//
// Candidate-nomination worker. Runs the saliency backend on every frame
// the preprocess stage samples to it and always forwards the resulting
// list — an empty list is information too: it lets the track stage
// advance its seed pointer without stalling.

use super::message::{Envelope, Payload, StageId};
use super::metrics::PipelineMetrics;
use super::stage::{Stage, StageContext, Step};
use crate::saliency::SaliencyBackend;
use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use tracing::debug;

pub struct SaliencyStage {
    backend: Box<dyn SaliencyBackend>,
    budget: usize,
    from_preprocess: Receiver<Envelope>,
    to_track: Sender<Envelope>,
    metrics: Arc<PipelineMetrics>,
}

impl SaliencyStage {
    pub fn new(
        backend: Box<dyn SaliencyBackend>,
        budget: usize,
        from_preprocess: Receiver<Envelope>,
        to_track: Sender<Envelope>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            backend,
            budget,
            from_preprocess,
            to_track,
            metrics,
        }
    }
}

impl Stage for SaliencyStage {
    fn id(&self) -> StageId {
        StageId::SaliencySample
    }

    fn run(&mut self, ctx: &StageContext) -> Result<()> {
        loop {
            let envelope = match ctx.recv(&self.from_preprocess) {
                Step::Data(env) => env,
                Step::Exit | Step::Disconnected => return Ok(()),
            };
            let frame_number = envelope.frame_number;

            let data = match envelope.payload {
                Payload::Frame(data) => data,
                Payload::StreamEnd => return Ok(()),
                other => bail!(
                    "saliency stage received unexpected {} payload at frame {frame_number}",
                    other.kind()
                ),
            };

            let candidates = self.backend.sample(&data.gray, self.budget);
            debug!(
                frame = frame_number,
                n = candidates.len(),
                backend = self.backend.name(),
                "candidates nominated"
            );
            self.metrics.inc(&self.metrics.saliency_samples);
            self.metrics
                .add(&self.metrics.candidates_nominated, candidates.len() as u64);

            let envelope = Envelope {
                frame_number,
                from: StageId::SaliencySample,
                payload: Payload::Candidates(candidates),
            };
            if !ctx.send(&self.to_track, envelope) {
                return Ok(());
            }
        }
    }
}
