// src/pipeline/metrics.rs
//
// Per-stage counters, shared across worker threads. Snapshot with
// `summary()` for the end-of-run log line or serialized export.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct PipelineMetrics {
    pub frames_preprocessed: AtomicU64,
    pub degenerate_frames: AtomicU64,
    pub masks_segmented: AtomicU64,
    pub saliency_samples: AtomicU64,
    pub candidates_nominated: AtomicU64,
    pub frames_tracked: AtomicU64,
    pub events_recorded: AtomicU64,
    pub frames_rendered: AtomicU64,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_preprocessed: AtomicU64::new(0),
            degenerate_frames: AtomicU64::new(0),
            masks_segmented: AtomicU64::new(0),
            saliency_samples: AtomicU64::new(0),
            candidates_nominated: AtomicU64::new(0),
            frames_tracked: AtomicU64::new(0),
            events_recorded: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_tracked.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_preprocessed: self.frames_preprocessed.load(Ordering::Relaxed),
            degenerate_frames: self.degenerate_frames.load(Ordering::Relaxed),
            masks_segmented: self.masks_segmented.load(Ordering::Relaxed),
            saliency_samples: self.saliency_samples.load(Ordering::Relaxed),
            candidates_nominated: self.candidates_nominated.load(Ordering::Relaxed),
            frames_tracked: self.frames_tracked.load(Ordering::Relaxed),
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            fps: self.fps(),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub frames_preprocessed: u64,
    pub degenerate_frames: u64,
    pub masks_segmented: u64,
    pub saliency_samples: u64,
    pub candidates_nominated: u64,
    pub frames_tracked: u64,
    pub events_recorded: u64,
    pub frames_rendered: u64,
    pub fps: f64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = PipelineMetrics::new();
        m.inc(&m.frames_tracked);
        m.inc(&m.frames_tracked);
        m.add(&m.candidates_nominated, 5);
        let s = m.summary();
        assert_eq!(s.frames_tracked, 2);
        assert_eq!(s.candidates_nominated, 5);
        assert!(serde_json::to_string(&s).is_ok());
    }
}
