use std::path::Path;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;

use super::{
    PoseDetection, PoseLandmarker,
    common::{self, flat_output, load_session, scalar_output},
};
use crate::{layout::POSE_POINTS, types::Frame};

pub const POSE_INPUT_SIZE: u32 = 256;
// x, y, z, visibility, presence
const POSE_LANDMARK_STRIDE: usize = 5;

#[derive(Clone, Debug)]
pub struct PoseLandmarkerConfig {
    pub min_confidence: f32,
}

impl Default for PoseLandmarkerConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
        }
    }
}

/// Full-body landmarker run on the letterboxed frame; assumes a single,
/// roughly centered subject.
pub struct OrtPoseLandmarker {
    session: Session,
    cfg: PoseLandmarkerConfig,
}

impl OrtPoseLandmarker {
    pub fn new(model_path: &Path, cfg: PoseLandmarkerConfig, intra_threads: usize) -> Result<Self> {
        let session = load_session(model_path, intra_threads)?;
        log::info!("pose landmarker ready using {}", model_path.display());
        Ok(Self { session, cfg })
    }
}

impl PoseLandmarker for OrtPoseLandmarker {
    fn detect(&mut self, frame: &Frame, _timestamp_ms: u64) -> Result<Option<PoseDetection>> {
        let (input, letterbox) = common::prepare_frame_with_size(frame, POSE_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run pose landmark session")?;

        let score = scalar_output(&outputs, 1).unwrap_or(0.0);
        if score < self.cfg.min_confidence {
            return Ok(None);
        }

        let flat = flat_output(&outputs, 0)?;
        let landmarks = common::decode_landmarks(&flat, POSE_POINTS, POSE_LANDMARK_STRIDE)?
            .into_iter()
            .map(|p| letterbox.to_normalized(p))
            .collect();

        Ok(Some(PoseDetection { landmarks, score }))
    }
}
