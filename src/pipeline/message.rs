// src/pipeline/message.rs
//
// Message vocabulary of the worker graph. Data envelopes flow along the
// bounded inter-stage channels; control messages and replies flow on
// separate unbounded channels between the controller and each worker.

use crate::saliency::Candidate;
use crate::types::{GrayFrame, RgbFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Controller,
    Preprocess,
    Segment,
    SaliencySample,
    Track,
}

impl StageId {
    pub fn name(&self) -> &'static str {
        match self {
            StageId::Controller => "controller",
            StageId::Preprocess => "preprocess",
            StageId::Segment => "segment",
            StageId::SaliencySample => "saliency-sample",
            StageId::Track => "track",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A preprocessed frame. On the segmentation edge `background` and `rgb`
/// are populated; on the saliency edge `gray` already is the
/// difference-from-mean image and the rest is omitted.
#[derive(Debug, Clone)]
pub struct FrameData {
    pub gray: GrayFrame,
    pub background: Option<GrayFrame>,
    pub rgb: Option<RgbFrame>,
    pub timecode: Option<String>,
}

/// A segmented frame with its paired raw frame.
#[derive(Debug, Clone)]
pub struct MaskData {
    pub mask: GrayFrame,
    pub rgb: Option<RgbFrame>,
    pub timecode: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Frame(FrameData),
    Mask(MaskData),
    Candidates(Vec<Candidate>),
    /// Upstream exhausted its input before the declared last frame.
    StreamEnd,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Frame(_) => "frame",
            Payload::Mask(_) => "mask",
            Payload::Candidates(_) => "candidates",
            Payload::StreamEnd => "stream-end",
        }
    }
}

/// Data envelope. Frame numbers are strictly increasing per logical
/// stream.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub frame_number: u32,
    pub from: StageId,
    pub payload: Payload,
}

/// Controller -> worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    Init,
    Start,
    /// Interrupts a worker blocked on a data receive or send.
    Exit,
    Shutdown,
}

/// Worker -> controller.
#[derive(Debug, Clone)]
pub enum ControlReply {
    InitFinished(StageId),
    ShutdownFinished(StageId),
    /// The track stage reached the declared last frame.
    StreamDone,
    /// A worker hit a fatal error; the run must terminate.
    Failed(StageId, String),
}
