// src/kalman.rs
//
// 1-D constant-velocity Kalman filter. Each track carries two of these,
// one per axis; the association cost is the innovation magnitude against
// the one-step-ahead prediction.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kalman1D {
    /// Filtered position estimate.
    x: f32,
    /// Filtered velocity estimate (pixels per frame).
    v: f32,
    /// Estimate covariance, row-major 2x2.
    p: [f32; 4],
    process_noise: f32,
    measurement_noise: f32,
}

impl Kalman1D {
    pub fn new(initial: f32, process_noise: f32, measurement_noise: f32) -> Self {
        Self {
            x: initial,
            v: 0.0,
            p: [1.0, 0.0, 0.0, 1.0],
            process_noise,
            measurement_noise,
        }
    }

    /// One-step-ahead predicted position (dt = 1 frame).
    pub fn predicted(&self) -> f32 {
        self.x + self.v
    }

    /// Cost of associating a measurement with this filter: the absolute
    /// innovation against the prediction. Pure; call as often as needed
    /// while scoring candidates.
    pub fn cost(&self, measurement: f32) -> f32 {
        (measurement - self.predicted()).abs()
    }

    /// Fold in a measurement and return the new filtered position.
    /// Call exactly once per associated frame; extrapolated (placeholder)
    /// tokens must not update the filter.
    pub fn update(&mut self, measurement: f32) -> f32 {
        // predict: x' = x + v, P' = F P F^T + Q
        let xp = self.x + self.v;
        let vp = self.v;

        let [p00, p01, p10, p11] = self.p;
        let q = self.process_noise;
        // F = [1 1; 0 1]; Q scaled for a unit-interval white-acceleration model
        let pp00 = p00 + p01 + p10 + p11 + 0.25 * q;
        let pp01 = p01 + p11 + 0.5 * q;
        let pp10 = p10 + p11 + 0.5 * q;
        let pp11 = p11 + q;

        // gain: K = P' H^T / (H P' H^T + R), H = [1 0]
        let s = pp00 + self.measurement_noise;
        let k0 = pp00 / s;
        let k1 = pp10 / s;

        let innovation = measurement - xp;
        self.x = xp + k0 * innovation;
        self.v = vp + k1 * innovation;

        // P = (I - K H) P'
        self.p = [
            (1.0 - k0) * pp00,
            (1.0 - k0) * pp01,
            pp10 - k1 * pp00,
            pp11 - k1 * pp01,
        ];

        self.x
    }

    pub fn velocity(&self) -> f32 {
        self.v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_on_constant_velocity() {
        let mut kf = Kalman1D::new(0.0, 0.1, 2.0);
        // object moving at 2 px/frame
        for i in 1..=30 {
            kf.update(2.0 * i as f32);
        }
        assert!(
            (kf.velocity() - 2.0).abs() < 0.2,
            "velocity estimate {} should approach 2.0",
            kf.velocity()
        );
        assert!((kf.predicted() - 62.0).abs() < 1.0);
    }

    #[test]
    fn test_cost_is_innovation_magnitude() {
        let mut kf = Kalman1D::new(10.0, 0.1, 2.0);
        kf.update(12.0);
        let pred = kf.predicted();
        assert!((kf.cost(pred + 5.0) - 5.0).abs() < 1e-5);
        assert!((kf.cost(pred - 3.0) - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_deterministic() {
        let run = || {
            let mut kf = Kalman1D::new(5.0, 0.1, 2.0);
            let mut out = Vec::new();
            for z in [6.0f32, 8.5, 9.0, 12.0, 13.5] {
                out.push(kf.update(z));
            }
            out
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_cost_pure_between_updates() {
        let kf = Kalman1D::new(0.0, 0.1, 2.0);
        let a = kf.cost(4.0);
        let b = kf.cost(4.0);
        assert_eq!(a, b);
    }
}
