//! Request-level failures surfaced to callers of the recognition core.
//!
//! Per-frame detector errors and per-sample inference errors are absorbed
//! inside the pipeline; only the conditions below abort a request.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecognitionError>;

#[derive(Debug, Error)]
pub enum RecognitionError {
    /// A landmark detector could not be created.
    #[error("detector initialization failed: {0}")]
    DetectorInit(String),
    /// The video could not be decoded, had no frames, or every frame failed.
    #[error("keypoint extraction failed: {0}")]
    ExtractionFailed(String),
    /// The video decoded fine but no sample produced usable keypoints.
    #[error("insufficient keypoints: {0}")]
    InsufficientKeypoints(String),
    #[error("model inference failed: {0}")]
    ModelInference(String),
    #[error("failed to load model weights: {0}")]
    Weights(String),
    #[error("gloss table error: {0}")]
    Gloss(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The background recognition worker has shut down.
    #[error("recognition worker unavailable")]
    WorkerUnavailable,
}

impl RecognitionError {
    pub fn extraction(err: impl std::fmt::Display) -> Self {
        Self::ExtractionFailed(err.to_string())
    }

    pub fn inference(err: impl std::fmt::Display) -> Self {
        Self::ModelInference(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_and_insufficient_are_distinct() {
        let a = RecognitionError::extraction("no frames");
        let b = RecognitionError::InsufficientKeypoints("all samples empty".into());
        assert_eq!(a.to_string(), "keypoint extraction failed: no frames");
        assert_eq!(b.to_string(), "insufficient keypoints: all samples empty");
        assert!(matches!(a, RecognitionError::ExtractionFailed(_)));
        assert!(!matches!(b, RecognitionError::ExtractionFailed(_)));
    }
}
