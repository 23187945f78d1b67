use std::path::Path;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;

use super::{
    HandDetection, HandLandmarker,
    common::{self, flat_output, load_session, scalar_output},
    palm::{PalmDetector, PalmDetectorConfig},
};
use crate::{
    layout::HAND_POINTS,
    types::{Frame, Handedness},
};

pub const HAND_INPUT_SIZE: u32 = 224;

#[derive(Clone, Debug)]
pub struct HandLandmarkerConfig {
    pub palm: PalmDetectorConfig,
    pub max_hands: usize,
    pub min_confidence: f32,
}

impl Default for HandLandmarkerConfig {
    fn default() -> Self {
        Self {
            palm: PalmDetectorConfig::default(),
            max_hands: 2,
            min_confidence: 0.5,
        }
    }
}

/// Two-stage hand landmarker: palm detection, then 21-point landmark
/// regression on a rotated crop around each palm.
pub struct OrtHandLandmarker {
    palm_detector: PalmDetector,
    handpose: Session,
    cfg: HandLandmarkerConfig,
}

impl OrtHandLandmarker {
    pub fn new(
        palm_model_path: &Path,
        handpose_model_path: &Path,
        cfg: HandLandmarkerConfig,
        intra_threads: usize,
    ) -> Result<Self> {
        let palm_detector = PalmDetector::new(palm_model_path, cfg.palm.clone(), intra_threads)
            .with_context(|| {
                format!(
                    "failed to load palm detector from {}",
                    palm_model_path.display()
                )
            })?;
        let handpose = load_session(handpose_model_path, intra_threads)?;
        log::info!(
            "hand landmarker ready using {} and palm detector {}",
            handpose_model_path.display(),
            palm_model_path.display()
        );

        Ok(Self {
            palm_detector,
            handpose,
            cfg,
        })
    }
}

impl HandLandmarker for OrtHandLandmarker {
    fn detect(&mut self, frame: &Frame, _timestamp_ms: u64) -> Result<Vec<HandDetection>> {
        let palms = self.palm_detector.detect(frame)?;
        let mut hands = Vec::with_capacity(self.cfg.max_hands);

        for palm in palms.iter().take(self.cfg.max_hands) {
            let roi = palm.hand_roi();
            let (input, transform) = common::prepare_rotated_crop(
                frame,
                roi.center,
                roi.side,
                roi.angle,
                HAND_INPUT_SIZE,
            )?;
            let tensor = Tensor::from_array(input)?;
            let outputs = self
                .handpose
                .run(ort::inputs![tensor])
                .context("failed to run hand landmark session")?;

            let confidence = scalar_output(&outputs, 1).unwrap_or(0.0).clamp(0.0, 1.0);
            if confidence < self.cfg.min_confidence {
                continue;
            }
            let handedness = Handedness::from_score(scalar_output(&outputs, 2).unwrap_or(1.0));

            let flat = flat_output(&outputs, 0)?;
            let landmarks = common::decode_landmarks(&flat, HAND_POINTS, 3)?
                .into_iter()
                .map(|p| transform.to_normalized(p))
                .collect();

            hands.push(HandDetection {
                landmarks,
                handedness,
                score: confidence * palm.score,
            });
        }

        Ok(hands)
    }
}
