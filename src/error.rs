// src/error.rs
//
// Error taxonomy for the detection core. Recoverable kinds are handled by
// the caller (a missing candidate is just absent); fatal kinds indicate a
// broken algorithm invariant or pipeline ordering guarantee and terminate
// the run with a diagnostic naming the frame and stage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Extraction found no foreground pixels. Recoverable: the caller
    /// treats the candidate as absent.
    #[error("no foreground object at the requested location")]
    EmptyRegion,

    /// Fewer frames available than a cache or window requires.
    /// Recoverable: use what is available and log a warning.
    #[error("input exhausted: wanted {wanted} frames, got {got}")]
    InputExhausted { wanted: usize, got: usize },

    /// The extraction algorithm produced inconsistent state (bounding box
    /// not tight, area mismatch). Fatal: a defect, not an input condition.
    /// The stage that hits this attaches the frame number on propagation.
    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },

    /// A worker received a frame number that does not match its own
    /// sequence counter. Fatal: the pipeline ordering guarantee is broken.
    #[error("stream desynchronization in {stage} stage: expected frame {expected}, received {received}")]
    StreamDesync {
        stage: &'static str,
        expected: u32,
        received: u32,
    },

    /// Mismatched raster dimensions between collaborating buffers. Fatal.
    #[error("dimension mismatch: {detail}")]
    DimensionMismatch { detail: String },
}

impl CoreError {
    /// Whether this error must terminate the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CoreError::EmptyRegion | CoreError::InputExhausted { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!CoreError::EmptyRegion.is_fatal());
        assert!(!CoreError::InputExhausted { wanted: 10, got: 3 }.is_fatal());
        assert!(CoreError::StreamDesync {
            stage: "track",
            expected: 5,
            received: 7
        }
        .is_fatal());
        assert!(CoreError::InvariantViolation {
            detail: "bbox not tight".into()
        }
        .is_fatal());
    }
}
