// src/frame_cache.rs
//
// Fixed-capacity FIFO of recent frames with an incrementally maintained
// mean. The mean is the background model: segmentation and saliency both
// run on "difference from running mean" images queried here.

use crate::error::{CoreError, CoreResult};
use crate::types::GrayFrame;
use std::collections::VecDeque;
use tracing::debug;

pub struct FrameCache {
    capacity: usize,
    frames: VecDeque<GrayFrame>,
    /// Per-pixel running sum of the cached frames.
    sum: Vec<u32>,
    width: usize,
    height: usize,
}

impl FrameCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame cache capacity must be at least 1");
        Self {
            capacity,
            frames: VecDeque::with_capacity(capacity),
            sum: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame, evicting the oldest once at capacity. The running
    /// sum is updated incrementally, never recomputed from scratch.
    pub fn push(&mut self, frame: GrayFrame) -> CoreResult<()> {
        if self.frames.is_empty() {
            self.width = frame.width;
            self.height = frame.height;
            self.sum = vec![0u32; frame.width * frame.height];
        } else if frame.dims() != (self.width, self.height) {
            return Err(CoreError::DimensionMismatch {
                detail: format!(
                    "cache holds {}x{} frames, pushed {}x{}",
                    self.width, self.height, frame.width, frame.height
                ),
            });
        }

        if self.frames.len() == self.capacity {
            // unwrap is safe: len == capacity > 0
            let oldest = self.frames.pop_front().unwrap();
            for (s, &v) in self.sum.iter_mut().zip(oldest.data.iter()) {
                *s -= v as u32;
            }
        }
        for (s, &v) in self.sum.iter_mut().zip(frame.data.iter()) {
            *s += v as u32;
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Degenerate-input guard: a frame with intensity std-dev at or below
    /// `min_std_dev` is replaced by the current mean so it cannot pollute
    /// the background model. Returns whether the original frame was kept.
    pub fn admit(&mut self, frame: GrayFrame, min_std_dev: f32) -> CoreResult<bool> {
        if min_std_dev > 0.0 && !self.frames.is_empty() {
            let std_dev = frame.std_dev();
            if std_dev <= min_std_dev {
                debug!(
                    std_dev,
                    min_std_dev, "frame intensity deviation too low, caching mean instead"
                );
                let mean = self.mean().unwrap_or(frame);
                self.push(mean)?;
                return Ok(false);
            }
        }
        self.push(frame)?;
        Ok(true)
    }

    /// The mean of all cached frames; `None` while the cache is empty.
    pub fn mean(&self) -> Option<GrayFrame> {
        if self.frames.is_empty() {
            return None;
        }
        let n = self.frames.len() as u32;
        let data = self.sum.iter().map(|&s| (s / n) as u8).collect();
        Some(GrayFrame::new(data, self.width, self.height))
    }

    /// Per-pixel |frame - mean|.
    pub fn diff_from_mean(&self, frame: &GrayFrame) -> CoreResult<GrayFrame> {
        self.check_dims(frame)?;
        let n = self.frames.len() as u32;
        let data = frame
            .data
            .iter()
            .zip(self.sum.iter())
            .map(|(&v, &s)| {
                let m = (s / n) as i16;
                (v as i16 - m).unsigned_abs() as u8
            })
            .collect();
        Ok(GrayFrame::new(data, self.width, self.height))
    }

    /// Per-pixel max(frame - mean, 0): the clamped difference avoids the
    /// negative-intensity ghosts a departing object leaves in the mean.
    pub fn clamped_diff_from_mean(&self, frame: &GrayFrame) -> CoreResult<GrayFrame> {
        self.check_dims(frame)?;
        let n = self.frames.len() as u32;
        let data = frame
            .data
            .iter()
            .zip(self.sum.iter())
            .map(|(&v, &s)| {
                let m = (s / n) as i16;
                (v as i16 - m).max(0) as u8
            })
            .collect();
        Ok(GrayFrame::new(data, self.width, self.height))
    }

    /// Point query by recency: 0 is the newest cached frame.
    pub fn recent(&self, index: usize) -> Option<&GrayFrame> {
        if index >= self.frames.len() {
            return None;
        }
        self.frames.get(self.frames.len() - 1 - index)
    }

    fn check_dims(&self, frame: &GrayFrame) -> CoreResult<()> {
        if self.frames.is_empty() {
            return Err(CoreError::InputExhausted { wanted: 1, got: 0 });
        }
        if frame.dims() != (self.width, self.height) {
            return Err(CoreError::DimensionMismatch {
                detail: format!(
                    "query frame is {}x{}, cache holds {}x{}",
                    frame.width, frame.height, self.width, self.height
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(v: u8) -> GrayFrame {
        GrayFrame::new(vec![v; 16], 4, 4)
    }

    #[test]
    fn test_eviction_keeps_capacity() {
        let capacity = 3;
        let mut cache = FrameCache::new(capacity);
        // push capacity + k frames; oldest retained must be the k-th
        let k = 4;
        for i in 0..(capacity + k) {
            cache.push(flat(i as u8 * 10)).unwrap();
        }
        assert_eq!(cache.len(), capacity);
        // newest is the last pushed, oldest is push number k
        assert_eq!(cache.recent(0).unwrap().pixel(0, 0), ((capacity + k - 1) * 10) as u8);
        assert_eq!(cache.recent(capacity - 1).unwrap().pixel(0, 0), (k * 10) as u8);
        assert!(cache.recent(capacity).is_none());
    }

    #[test]
    fn test_incremental_mean_matches_direct() {
        let mut cache = FrameCache::new(4);
        for v in [10u8, 20, 30, 40, 50, 60] {
            cache.push(flat(v)).unwrap();
        }
        // window is now [30, 40, 50, 60]
        assert_eq!(cache.mean().unwrap().pixel(2, 2), 45);
    }

    #[test]
    fn test_diff_queries() {
        let mut cache = FrameCache::new(2);
        cache.push(flat(100)).unwrap();
        cache.push(flat(100)).unwrap();

        let brighter = flat(130);
        let darker = flat(70);
        assert_eq!(cache.diff_from_mean(&brighter).unwrap().pixel(0, 0), 30);
        assert_eq!(cache.diff_from_mean(&darker).unwrap().pixel(0, 0), 30);
        assert_eq!(cache.clamped_diff_from_mean(&brighter).unwrap().pixel(0, 0), 30);
        assert_eq!(cache.clamped_diff_from_mean(&darker).unwrap().pixel(0, 0), 0);
    }

    #[test]
    fn test_admit_substitutes_mean_for_uniform_frame() {
        let mut cache = FrameCache::new(4);
        let mut textured = GrayFrame::zeros(4, 4);
        for i in 0..16 {
            textured.data[i] = (i * 16) as u8;
        }
        cache.admit(textured.clone(), 1.0).unwrap();

        // uniform frame: rejected, the mean (== textured) is cached instead
        let kept = cache.admit(flat(0), 1.0).unwrap();
        assert!(!kept);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.recent(0).unwrap(), &cache.mean().unwrap());
    }

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let mut cache = FrameCache::new(2);
        cache.push(flat(10)).unwrap();
        let err = cache.push(GrayFrame::zeros(8, 8)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_query_on_empty_cache_is_recoverable() {
        let cache = FrameCache::new(2);
        let err = cache.diff_from_mean(&flat(1)).unwrap_err();
        assert!(!err.is_fatal());
    }
}
