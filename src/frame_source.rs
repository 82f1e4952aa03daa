// src/frame_source.rs
//
// Frame acquisition. Video decoding proper is out of scope; the pipeline
// reads through the FrameSource trait, and the bundled implementation
// walks a directory of numbered still frames. A synthetic in-memory
// source backs the tests and lets the whole pipeline run without any
// files on disk.

use crate::types::RgbFrame;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;

/// One decoded frame with its stream position and source metadata.
#[derive(Debug, Clone)]
pub struct SourcedFrame {
    pub frame_number: u32,
    pub rgb: RgbFrame,
    /// Timecode string, e.g. "00:01:23:11".
    pub timecode: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// The configured last frame has been delivered.
    #[error("end of stream")]
    EndOfStream,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait FrameSource: Send {
    /// Next frame in sequence; `EndOfStream` past the declared last frame.
    fn read_next(&mut self) -> Result<SourcedFrame, SourceError>;

    /// First frame number of this stream.
    fn start_frame(&self) -> u32;

    /// Declared last frame number of this stream.
    fn last_frame(&self) -> u32;

    /// Frame dimensions, known before the first read.
    fn dims(&self) -> (usize, usize);
}

/// Frame-per-frame timecode string at a nominal rate, HH:MM:SS:FF.
pub fn timecode_for_frame(frame_number: u32, fps: f32) -> String {
    let fps = if fps > 0.0 { fps } else { 29.97 };
    let whole_fps = fps.round() as u32;
    let total_secs = (frame_number as f32 / fps) as u32;
    let ff = frame_number % whole_fps.max(1);
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        ff
    )
}

/// Reads an alphabetically ordered directory of still images.
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    next_index: usize,
    start_frame: u32,
    last_frame: u32,
    fps: f32,
    width: usize,
    height: usize,
}

impl ImageSequenceSource {
    pub fn open(
        dir: &str,
        start_frame: u32,
        last_frame: Option<u32>,
        fps: f32,
    ) -> Result<Self> {
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("png") | Some("jpg") | Some("jpeg") | Some("bmp") | Some("pgm") | Some("ppm")
                )
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(anyhow!("no frame images found in {dir}"));
        }

        let stream_last = start_frame + files.len() as u32 - 1;
        let last_frame = match last_frame {
            Some(last) => last.min(stream_last),
            None => stream_last,
        };

        // probe the first image for the frame dimensions
        let first = image::open(&files[0])
            .with_context(|| format!("reading first frame {}", files[0].display()))?;
        let (width, height) = (first.width() as usize, first.height() as usize);

        info!(
            dir,
            frames = files.len(),
            start_frame,
            last_frame,
            width,
            height,
            "opened frame sequence"
        );

        Ok(Self {
            files,
            next_index: 0,
            start_frame,
            last_frame,
            fps,
            width,
            height,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn read_next(&mut self) -> Result<SourcedFrame, SourceError> {
        let frame_number = self.start_frame + self.next_index as u32;
        if frame_number > self.last_frame || self.next_index >= self.files.len() {
            return Err(SourceError::EndOfStream);
        }
        let path = &self.files[self.next_index];
        let img = image::open(path)
            .with_context(|| format!("reading frame {}", path.display()))?
            .to_rgb8();
        if (img.width() as usize, img.height() as usize) != (self.width, self.height) {
            return Err(SourceError::Other(anyhow!(
                "frame {} is {}x{}, sequence is {}x{}",
                path.display(),
                img.width(),
                img.height(),
                self.width,
                self.height
            )));
        }
        self.next_index += 1;
        Ok(SourcedFrame {
            frame_number,
            rgb: RgbFrame::new(img.into_raw(), self.width, self.height),
            timecode: Some(timecode_for_frame(frame_number, self.fps)),
        })
    }

    fn start_frame(&self) -> u32 {
        self.start_frame
    }

    fn last_frame(&self) -> u32 {
        self.last_frame
    }

    fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

/// In-memory source over a prepared frame list.
pub struct SyntheticSource {
    frames: Vec<RgbFrame>,
    next_index: usize,
    start_frame: u32,
    fps: f32,
}

impl SyntheticSource {
    pub fn new(frames: Vec<RgbFrame>, start_frame: u32, fps: f32) -> Self {
        assert!(!frames.is_empty(), "synthetic source needs at least one frame");
        Self {
            frames,
            next_index: 0,
            start_frame,
            fps,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn read_next(&mut self) -> Result<SourcedFrame, SourceError> {
        if self.next_index >= self.frames.len() {
            return Err(SourceError::EndOfStream);
        }
        let frame_number = self.start_frame + self.next_index as u32;
        let rgb = self.frames[self.next_index].clone();
        self.next_index += 1;
        Ok(SourcedFrame {
            frame_number,
            rgb,
            timecode: Some(timecode_for_frame(frame_number, self.fps)),
        })
    }

    fn start_frame(&self) -> u32 {
        self.start_frame
    }

    fn last_frame(&self) -> u32 {
        self.start_frame + self.frames.len() as u32 - 1
    }

    fn dims(&self) -> (usize, usize) {
        (self.frames[0].width, self.frames[0].height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timecode_format() {
        assert_eq!(timecode_for_frame(0, 30.0), "00:00:00:00");
        assert_eq!(timecode_for_frame(29, 30.0), "00:00:00:29");
        assert_eq!(timecode_for_frame(30, 30.0), "00:00:01:00");
        assert_eq!(timecode_for_frame(3600 * 30, 30.0), "01:00:00:00");
    }

    #[test]
    fn test_synthetic_source_sequence() {
        let frames = vec![RgbFrame::filled(8, 8, [0, 0, 0]); 3];
        let mut src = SyntheticSource::new(frames, 5, 30.0);
        assert_eq!(src.last_frame(), 7);
        assert_eq!(src.dims(), (8, 8));

        for expected in 5..=7 {
            let f = src.read_next().unwrap();
            assert_eq!(f.frame_number, expected);
            assert!(f.timecode.is_some());
        }
        assert!(matches!(src.read_next(), Err(SourceError::EndOfStream)));
    }
}
