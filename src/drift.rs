// src/drift.rs
//
// Drift (focus of expansion) estimation from the segmented video stream.
// Keeps the last three sub-sampled frames, computes per-column and
// per-row optical-flow ratios between them, averages over a rolling
// window, and fits a least-squares zero crossing independently in x and
// y. The crossing point is where apparent motion changes sign: the focus
// of expansion of the global scene drift.
//
// The estimate biases and annotates association; tracking stays correct
// without it, so any degenerate fit simply reports no drift.

use crate::types::{GrayFrame, PointF};
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DriftConfig {
    /// Rolling window of flow vectors averaged before the line fit.
    pub num_avg: usize,
    /// Power-of-two sub-sampling applied before flow computation.
    pub pyramid_level: u32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            num_avg: 20,
            pyramid_level: 0,
        }
    }
}

pub struct DriftEstimator {
    config: DriftConfig,
    frames: VecDeque<GrayFrame>,
    x_history: VecDeque<Vec<f32>>,
    y_history: VecDeque<Vec<f32>>,
    last: Option<PointF>,
}

impl DriftEstimator {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            frames: VecDeque::with_capacity(3),
            x_history: VecDeque::new(),
            y_history: VecDeque::new(),
            last: None,
        }
    }

    /// Feed the next frame; returns the updated drift vector, or `None`
    /// until three frames are available (or when the fit degenerates).
    pub fn update(&mut self, frame: &GrayFrame) -> Option<PointF> {
        let mut sub = frame.clone();
        for _ in 0..self.config.pyramid_level {
            sub = sub.half_size();
        }

        if self.frames.len() == 3 {
            self.frames.pop_front();
        }
        self.frames.push_back(sub);

        // need (t-1), t, (t+1) for temporal derivatives
        if self.frames.len() < 3 {
            return None;
        }

        let w = self.frames[1].width;
        let h = self.frames[1].height;
        if w < 3 || h < 3 {
            return None;
        }

        let prev = &self.frames[0];
        let curr = &self.frames[1];
        let next = &self.frames[2];

        // flow x-components summed per column, y-components per row
        let mut vx = vec![0.0f32; w - 2];
        let mut vy = vec![0.0f32; h - 2];
        let mut cx = vec![0u32; w - 2];
        let mut cy = vec![0u32; h - 2];

        for y in 0..h - 2 {
            for x in 0..w - 2 {
                let xm = curr.pixel(x, y + 1) as f32;
                let xp = curr.pixel(x + 2, y + 1) as f32;
                let ym = curr.pixel(x + 1, y) as f32;
                let yp = curr.pixel(x + 1, y + 2) as f32;
                let tm = prev.pixel(x + 1, y + 1) as f32;
                let tp = next.pixel(x + 1, y + 1) as f32;

                if xp != xm {
                    vx[x] += (tm - tp) / (xp - xm);
                    cx[x] += 1;
                }
                if yp != ym {
                    vy[y] += (tm - tp) / (yp - ym);
                    cy[y] += 1;
                }
            }
        }
        for x in 0..w - 2 {
            if cx[x] > 0 {
                vx[x] /= cx[x] as f32;
            }
        }
        for y in 0..h - 2 {
            if cy[y] > 0 {
                vy[y] /= cy[y] as f32;
            }
        }

        if self.x_history.len() == self.config.num_avg {
            self.x_history.pop_front();
            self.y_history.pop_front();
        }
        self.x_history.push_back(vx);
        self.y_history.push_back(vy);

        let x0 = zero_crossing(&mean_vector(&self.x_history));
        let y0 = zero_crossing(&mean_vector(&self.y_history));
        let (x0, y0) = match (x0, y0) {
            (Some(x0), Some(y0)) => (x0, y0),
            _ => {
                debug!("drift fit degenerate, reporting no drift");
                self.last = None;
                return None;
            }
        };

        // rescale by the sub-sampling factor; +1 compensates the border
        // trimmed by the derivative stencil
        let scale = (1u32 << self.config.pyramid_level) as f32;
        let foe = PointF::new(scale * (x0 + 1.0), scale * (y0 + 1.0));
        if !foe.x.is_finite() || !foe.y.is_finite() {
            self.last = None;
            return None;
        }
        self.last = Some(foe);
        self.last
    }

    pub fn last_drift(&self) -> Option<PointF> {
        self.last
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.x_history.clear();
        self.y_history.clear();
        self.last = None;
    }
}

/// Element-wise mean over the stored vectors. All entries share a length
/// because frame dimensions are constant within a run.
fn mean_vector(history: &VecDeque<Vec<f32>>) -> Vec<f32> {
    let Some(first) = history.front() else {
        return Vec::new();
    };
    let mut mean = vec![0.0f32; first.len()];
    for vec in history {
        for (m, v) in mean.iter_mut().zip(vec.iter()) {
            *m += v;
        }
    }
    let n = history.len() as f32;
    for m in &mut mean {
        *m /= n;
    }
    mean
}

/// Least-squares line through (index, value); returns the index where the
/// fitted line crosses zero, or `None` when the fit is degenerate.
fn zero_crossing(vec: &[f32]) -> Option<f32> {
    let n = vec.len() as f32;
    if vec.len() < 2 {
        return None;
    }
    let sx = n * (n - 1.0) / 2.0;
    let sxx = n * (n - 1.0) * (2.0 * n - 1.0) / 6.0;
    let mut sy = 0.0f32;
    let mut sxy = 0.0f32;
    for (i, &v) in vec.iter().enumerate() {
        sy += v;
        sxy += i as f32 * v;
    }
    let denom = n * sxy - sx * sy;
    if denom == 0.0 {
        return None;
    }
    let x0 = (sx * sxy - sxx * sy) / denom;
    if x0.is_finite() {
        Some(x0)
    } else {
        None
    }
}
