// src/segmentation.rs
//
// Pluggable pixel-level segmentation: turn a frame plus the background
// model into a binary foreground mask. Backends are configuration
// selected and opaque to the tracking core, which only requires a mask
// of the input's dimensions.
//
// Ships two adaptive-threshold backends (mean and median over tiles of
// the clamped background difference), the morphological mask cleanup,
// and the region-of-disinterest mask applied after segmentation.

use crate::config::DetectionConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::{GrayFrame, Rect};
use anyhow::{Context, Result};
use tracing::warn;

pub trait SegmentationBackend: Send {
    fn name(&self) -> &'static str;

    /// Produce a binary mask (0 background, 255 foreground) of the same
    /// dimensions as `frame`. `background` is the running-mean model.
    fn segment(&self, frame: &GrayFrame, background: &GrayFrame) -> CoreResult<GrayFrame>;
}

/// Foreground where the clamped background difference exceeds the tile
/// mean by a fixed offset.
pub struct MeanAdaptiveSegmenter {
    pub offset: i32,
    pub block_size: usize,
}

/// Same scheme with the tile median, more tolerant of bright outliers.
pub struct MedianAdaptiveSegmenter {
    pub offset: i32,
    pub block_size: usize,
}

impl SegmentationBackend for MeanAdaptiveSegmenter {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn segment(&self, frame: &GrayFrame, background: &GrayFrame) -> CoreResult<GrayFrame> {
        let diff = clamped_diff(frame, background)?;
        Ok(threshold_tiles(&diff, self.block_size, self.offset, |tile| {
            let sum: u32 = tile.iter().map(|&v| v as u32).sum();
            (sum / tile.len() as u32) as i32
        }))
    }
}

impl SegmentationBackend for MedianAdaptiveSegmenter {
    fn name(&self) -> &'static str {
        "median"
    }

    fn segment(&self, frame: &GrayFrame, background: &GrayFrame) -> CoreResult<GrayFrame> {
        let diff = clamped_diff(frame, background)?;
        Ok(threshold_tiles(&diff, self.block_size, self.offset, |tile| {
            let mut vals: Vec<u8> = tile.to_vec();
            vals.sort_unstable();
            vals[vals.len() / 2] as i32
        }))
    }
}

/// Select the configured backend; unknown names fall back to mean.
pub fn make_backend(cfg: &DetectionConfig) -> Box<dyn SegmentationBackend> {
    match cfg.segmenter.as_str() {
        "median" => Box::new(MedianAdaptiveSegmenter {
            offset: cfg.segment_offset,
            block_size: cfg.segment_block_size,
        }),
        "mean" => Box::new(MeanAdaptiveSegmenter {
            offset: cfg.segment_offset,
            block_size: cfg.segment_block_size,
        }),
        other => {
            warn!(segmenter = other, "unknown segmenter, using mean");
            Box::new(MeanAdaptiveSegmenter {
                offset: cfg.segment_offset,
                block_size: cfg.segment_block_size,
            })
        }
    }
}

fn clamped_diff(frame: &GrayFrame, background: &GrayFrame) -> CoreResult<GrayFrame> {
    if frame.dims() != background.dims() {
        return Err(CoreError::DimensionMismatch {
            detail: format!(
                "frame is {}x{}, background model is {}x{}",
                frame.width, frame.height, background.width, background.height
            ),
        });
    }
    let data = frame
        .data
        .iter()
        .zip(background.data.iter())
        .map(|(&f, &b)| (f as i16 - b as i16).max(0) as u8)
        .collect();
    Ok(GrayFrame::new(data, frame.width, frame.height))
}

/// Threshold each `block` x `block` tile against `stat(tile) + offset`.
fn threshold_tiles(
    diff: &GrayFrame,
    block: usize,
    offset: i32,
    stat: impl Fn(&[u8]) -> i32,
) -> GrayFrame {
    let block = block.max(1);
    let (w, h) = diff.dims();
    let mut mask = GrayFrame::zeros(w, h);

    for ty in (0..h).step_by(block) {
        for tx in (0..w).step_by(block) {
            let bw = block.min(w - tx);
            let bh = block.min(h - ty);
            let mut tile = Vec::with_capacity(bw * bh);
            for y in ty..ty + bh {
                let row = y * w;
                tile.extend_from_slice(&diff.data[row + tx..row + tx + bw]);
            }
            let threshold = stat(&tile) + offset;
            for y in ty..ty + bh {
                for x in tx..tx + bw {
                    if diff.pixel(x, y) as i32 > threshold {
                        mask.set_pixel(x, y, 255);
                    }
                }
            }
        }
    }
    mask
}

/// Morphological closing (dilate then erode) with a square structuring
/// element of edge `size`. Fills pinholes and reconnects speckled blobs
/// without changing the area of solid convex shapes. `size` <= 1 is a
/// no-op.
pub fn cleanup_mask(mask: &GrayFrame, size: u32) -> GrayFrame {
    if size <= 1 {
        return mask.clone();
    }
    erode(&dilate(mask, size), size)
}

fn se_offsets(size: u32) -> (i32, i32) {
    let size = size as i32;
    // square SE centered with the extra pixel trailing for even sizes
    (-(size / 2), (size - 1) / 2)
}

pub fn dilate(mask: &GrayFrame, size: u32) -> GrayFrame {
    let (lo, hi) = se_offsets(size);
    let (w, h) = mask.dims();
    let mut out = GrayFrame::zeros(w, h);
    for y in 0..h as i32 {
        for x in 0..w as i32 {
            'probe: for dy in lo..=hi {
                for dx in lo..=hi {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx >= 0
                        && ny >= 0
                        && nx < w as i32
                        && ny < h as i32
                        && mask.pixel(nx as usize, ny as usize) != 0
                    {
                        out.set_pixel(x as usize, y as usize, 255);
                        break 'probe;
                    }
                }
            }
        }
    }
    out
}

pub fn erode(mask: &GrayFrame, size: u32) -> GrayFrame {
    // probe the reflected structuring element so dilate-then-erode is a
    // proper closing even for even-sized elements
    let (lo, hi) = se_offsets(size);
    let (lo, hi) = (-hi, -lo);
    let (w, h) = mask.dims();
    let mut out = GrayFrame::zeros(w, h);
    for y in 0..h as i32 {
        for x in 0..w as i32 {
            let mut keep = true;
            'probe: for dy in lo..=hi {
                for dx in lo..=hi {
                    let (nx, ny) = (x + dx, y + dy);
                    // pixels beyond the border count as foreground so
                    // blobs touching the edge are not eaten away
                    if nx >= 0
                        && ny >= 0
                        && nx < w as i32
                        && ny < h as i32
                        && mask.pixel(nx as usize, ny as usize) == 0
                    {
                        keep = false;
                        break 'probe;
                    }
                }
            }
            if keep {
                out.set_pixel(x as usize, y as usize, 255);
            }
        }
    }
    out
}

/// Region-of-disinterest mask: segmentation output outside the allowed
/// area is discarded. Configured as a rectangle or a mask image file.
pub struct DisinterestMask {
    allow: GrayFrame,
}

impl DisinterestMask {
    /// Build from configuration; `None` when no mask is configured.
    pub fn from_config(cfg: &DetectionConfig, width: usize, height: usize) -> Result<Option<Self>> {
        if let Some(path) = &cfg.mask_image {
            let img = image::open(path)
                .with_context(|| format!("loading mask image {path}"))?
                .to_luma8();
            if (img.width() as usize, img.height() as usize) != (width, height) {
                anyhow::bail!(
                    "mask image {path} is {}x{}, frames are {width}x{height}",
                    img.width(),
                    img.height()
                );
            }
            let allow = GrayFrame::new(img.into_raw(), width, height);
            return Ok(Some(Self { allow }));
        }
        if let Some([left, top, w, h]) = cfg.mask_rect {
            let mut allow = GrayFrame::zeros(width, height);
            if let Some(rect) = Rect::new(left, top, w, h).clip_to(width, height) {
                for y in rect.top..=rect.bottom() {
                    for x in rect.left..=rect.right() {
                        allow.set_pixel(x as usize, y as usize, 255);
                    }
                }
            }
            return Ok(Some(Self { allow }));
        }
        Ok(None)
    }

    pub fn apply(&self, mask: &mut GrayFrame) {
        for (m, &a) in mask.data.iter_mut().zip(self.allow.data.iter()) {
            if a == 0 {
                *m = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_square(w: usize, h: usize, left: usize, top: usize, size: usize, v: u8) -> GrayFrame {
        let mut img = GrayFrame::zeros(w, h);
        for y in top..top + size {
            for x in left..left + size {
                img.set_pixel(x, y, v);
            }
        }
        img
    }

    fn count_fg(mask: &GrayFrame) -> usize {
        mask.data.iter().filter(|&&v| v != 0).count()
    }

    #[test]
    fn test_mean_segmenter_finds_bright_square() {
        let seg = MeanAdaptiveSegmenter {
            offset: 7,
            block_size: 16,
        };
        let frame = frame_with_square(64, 64, 20, 20, 10, 220);
        let background = GrayFrame::zeros(64, 64);
        let mask = seg.segment(&frame, &background).unwrap();
        assert_eq!(count_fg(&mask), 100);
    }

    #[test]
    fn test_median_segmenter_finds_bright_square() {
        let seg = MedianAdaptiveSegmenter {
            offset: 7,
            block_size: 16,
        };
        let frame = frame_with_square(64, 64, 5, 5, 8, 200);
        let background = GrayFrame::zeros(64, 64);
        let mask = seg.segment(&frame, &background).unwrap();
        assert_eq!(count_fg(&mask), 64);
    }

    #[test]
    fn test_uniform_frame_segments_empty() {
        let seg = MeanAdaptiveSegmenter {
            offset: 7,
            block_size: 16,
        };
        let frame = GrayFrame::new(vec![90u8; 64 * 64], 64, 64);
        let background = GrayFrame::new(vec![90u8; 64 * 64], 64, 64);
        let mask = seg.segment(&frame, &background).unwrap();
        assert_eq!(count_fg(&mask), 0);
    }

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let seg = MeanAdaptiveSegmenter {
            offset: 7,
            block_size: 16,
        };
        let err = seg
            .segment(&GrayFrame::zeros(32, 32), &GrayFrame::zeros(16, 16))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_closing_preserves_solid_square() {
        let mask = frame_with_square(64, 64, 10, 10, 12, 255);
        let cleaned = cleanup_mask(&mask, 3);
        assert_eq!(count_fg(&cleaned), 144);
    }

    #[test]
    fn test_closing_fills_pinhole() {
        let mut mask = frame_with_square(64, 64, 10, 10, 12, 255);
        mask.set_pixel(15, 15, 0);
        let cleaned = cleanup_mask(&mask, 3);
        assert_eq!(cleaned.pixel(15, 15), 255);
        assert_eq!(count_fg(&cleaned), 144);
    }

    #[test]
    fn test_closing_removes_nothing_for_size_one() {
        let mask = frame_with_square(32, 32, 4, 4, 5, 255);
        assert_eq!(cleanup_mask(&mask, 1), mask);
    }

    #[test]
    fn test_disinterest_rect() {
        let cfg = DetectionConfig {
            mask_rect: Some([0, 0, 32, 64]),
            ..DetectionConfig::default()
        };
        let gate = DisinterestMask::from_config(&cfg, 64, 64).unwrap().unwrap();
        let mut mask = GrayFrame::new(vec![255u8; 64 * 64], 64, 64);
        gate.apply(&mut mask);
        assert_eq!(count_fg(&mask), 32 * 64);
        assert_eq!(mask.pixel(0, 0), 255);
        assert_eq!(mask.pixel(40, 0), 0);
    }

    #[test]
    fn test_no_mask_configured() {
        let cfg = DetectionConfig::default();
        assert!(DisinterestMask::from_config(&cfg, 64, 64).unwrap().is_none());
    }
}
