// src/saliency.rs
//
// Candidate-point nomination. The attention computation proper is an
// external collaborator; the core only depends on this contract: given a
// frame and a budget, return up to `budget` (point, strength) pairs.
// An empty list is a legitimate answer.
//
// The bundled sampler nominates the brightest points of the background
// difference image with non-maximum suppression, which is a serviceable
// stand-in for the full attention model on diff-from-mean input.

use crate::types::{GrayFrame, Point};
use serde::{Deserialize, Serialize};

/// A nominated point with its saliency strength in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub point: Point,
    pub strength: f32,
}

pub trait SaliencyBackend: Send {
    fn name(&self) -> &'static str;

    /// Nominate up to `budget` candidate points in `frame`.
    fn sample(&self, frame: &GrayFrame, budget: usize) -> Vec<Candidate>;
}

/// Greedy brightest-point sampler with a minimum separation between
/// returned candidates.
pub struct TopIntensitySampler {
    /// Intensities at or below this are never salient.
    pub intensity_floor: u8,
    /// Suppression radius around an accepted candidate.
    pub min_separation: u32,
}

impl SaliencyBackend for TopIntensitySampler {
    fn name(&self) -> &'static str {
        "top-intensity"
    }

    fn sample(&self, frame: &GrayFrame, budget: usize) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::new();
        if budget == 0 {
            return out;
        }
        let sep = self.min_separation as i64;

        let mut work = frame.data.clone();
        while out.len() < budget {
            // brightest remaining pixel; first occurrence wins ties so
            // the scan order keeps results deterministic
            let mut best_idx = 0usize;
            let mut best_val = 0u8;
            for (i, &v) in work.iter().enumerate() {
                if v > best_val {
                    best_val = v;
                    best_idx = i;
                }
            }
            if best_val <= self.intensity_floor {
                break;
            }
            let x = (best_idx % frame.width) as i32;
            let y = (best_idx / frame.width) as i32;
            out.push(Candidate {
                point: Point::new(x, y),
                strength: best_val as f32 / 255.0,
            });

            // suppress the neighborhood
            for sy in (y as i64 - sep).max(0)..=(y as i64 + sep).min(frame.height as i64 - 1) {
                for sx in (x as i64 - sep).max(0)..=(x as i64 + sep).min(frame.width as i64 - 1) {
                    work[sy as usize * frame.width + sx as usize] = 0;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dark_frame_yields_nothing() {
        let sampler = TopIntensitySampler {
            intensity_floor: 25,
            min_separation: 8,
        };
        let frame = GrayFrame::zeros(32, 32);
        assert!(sampler.sample(&frame, 10).is_empty());
    }

    #[test]
    fn test_brightest_point_first() {
        let sampler = TopIntensitySampler {
            intensity_floor: 25,
            min_separation: 4,
        };
        let mut frame = GrayFrame::zeros(32, 32);
        frame.set_pixel(10, 10, 200);
        frame.set_pixel(25, 25, 255);
        let cands = sampler.sample(&frame, 5);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].point, Point::new(25, 25));
        assert!((cands[0].strength - 1.0).abs() < 1e-5);
        assert_eq!(cands[1].point, Point::new(10, 10));
    }

    #[test]
    fn test_suppression_radius() {
        let sampler = TopIntensitySampler {
            intensity_floor: 25,
            min_separation: 8,
        };
        let mut frame = GrayFrame::zeros(32, 32);
        frame.set_pixel(10, 10, 255);
        frame.set_pixel(12, 10, 254); // inside the suppression radius
        frame.set_pixel(30, 10, 250); // outside
        let cands = sampler.sample(&frame, 5);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].point, Point::new(10, 10));
        assert_eq!(cands[1].point, Point::new(30, 10));
    }

    #[test]
    fn test_budget_respected() {
        let sampler = TopIntensitySampler {
            intensity_floor: 0,
            min_separation: 1,
        };
        let frame = GrayFrame::new(vec![200u8; 16 * 16], 16, 16);
        assert_eq!(sampler.sample(&frame, 3).len(), 3);
        assert!(sampler.sample(&frame, 0).is_empty());
    }
}
