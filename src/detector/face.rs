use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use super::{
    FaceDetection, FaceLandmarker, PoseDetection,
    common::{self, bounds, flat_output, load_session, scalar_output, sigmoid},
};
use crate::{layout::FACE_MESH_POINTS, types::Frame};

pub const FACE_INPUT_SIZE: u32 = 192;
/// Pose landmarks 0..=10 cover the nose, eyes, ears and mouth corners.
const POSE_FACE_POINTS: usize = 11;

#[derive(Clone, Debug)]
pub struct FaceLandmarkerConfig {
    pub min_confidence: f32,
    /// The face-presence output is a raw logit rather than a probability.
    pub score_is_logit: bool,
    /// Crop side relative to the extent of the previous frame's mesh.
    pub track_scale: f32,
    /// Crop side relative to the extent of the pose face points.
    pub hint_scale: f32,
}

impl Default for FaceLandmarkerConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            score_is_logit: true,
            track_scale: 1.5,
            hint_scale: 2.2,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FaceRoi {
    center: (f32, f32),
    side: f32,
}

/// Face mesh landmarker in video mode.
///
/// The crop for each frame comes from the previous frame's mesh when one was
/// found, otherwise from the pose face points, otherwise from the upper
/// center of the frame. Timestamps must not go backwards.
pub struct OrtFaceLandmarker {
    session: Session,
    cfg: FaceLandmarkerConfig,
    tracked: Option<FaceRoi>,
    last_timestamp: Option<u64>,
}

impl OrtFaceLandmarker {
    pub fn new(model_path: &Path, cfg: FaceLandmarkerConfig, intra_threads: usize) -> Result<Self> {
        let session = load_session(model_path, intra_threads)?;
        log::info!("face landmarker ready using {}", model_path.display());
        Ok(Self {
            session,
            cfg,
            tracked: None,
            last_timestamp: None,
        })
    }

    fn roi_for(&self, frame: &Frame, pose: Option<&PoseDetection>) -> FaceRoi {
        if let Some(roi) = self.tracked {
            return roi;
        }

        let (w, h) = (frame.width as f32, frame.height as f32);
        let hint = pose.and_then(|p| {
            let pts: Vec<(f32, f32)> = p
                .landmarks
                .iter()
                .take(POSE_FACE_POINTS)
                .filter(|kp| kp.is_present())
                .map(|kp| (kp.x * w, kp.y * h))
                .collect();
            bounds(&pts)
        });

        match hint {
            Some((x0, y0, x1, y1)) => FaceRoi {
                center: ((x0 + x1) * 0.5, (y0 + y1) * 0.5),
                side: ((x1 - x0).max(y1 - y0) * self.cfg.hint_scale).max(16.0),
            },
            None => FaceRoi {
                center: (w * 0.5, h * 0.3),
                side: w.min(h) * 0.5,
            },
        }
    }
}

impl FaceLandmarker for OrtFaceLandmarker {
    fn detect(
        &mut self,
        frame: &Frame,
        timestamp_ms: u64,
        pose: Option<&PoseDetection>,
    ) -> Result<Vec<FaceDetection>> {
        if let Some(last) = self.last_timestamp {
            if timestamp_ms < last {
                self.tracked = None;
                return Err(anyhow!(
                    "face landmarker timestamps must not decrease: {timestamp_ms} after {last}"
                ));
            }
        }
        self.last_timestamp = Some(timestamp_ms);

        let roi = self.roi_for(frame, pose);
        let (input, transform) =
            common::prepare_rotated_crop(frame, roi.center, roi.side, 0.0, FACE_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run face landmark session")?;

        let raw_score = scalar_output(&outputs, 1).unwrap_or(f32::MIN);
        let score = if self.cfg.score_is_logit {
            sigmoid(raw_score)
        } else {
            raw_score
        };
        if score < self.cfg.min_confidence {
            self.tracked = None;
            return Ok(Vec::new());
        }

        let flat = flat_output(&outputs, 0)?;
        let count = (flat.len() / 3).min(FACE_MESH_POINTS);
        let crop_points = common::decode_landmarks(&flat, count, 3)?;
        let landmarks: Vec<_> = crop_points
            .iter()
            .map(|&p| transform.to_normalized(p))
            .collect();

        let pixels: Vec<(f32, f32)> = crop_points
            .iter()
            .map(|p| transform.project(p[0], p[1]))
            .collect();
        self.tracked = bounds(&pixels).map(|(x0, y0, x1, y1)| FaceRoi {
            center: ((x0 + x1) * 0.5, (y0 + y1) * 0.5),
            side: ((x1 - x0).max(y1 - y0) * self.cfg.track_scale).max(16.0),
        });

        Ok(vec![FaceDetection { landmarks, score }])
    }

    fn reset(&mut self) -> Result<()> {
        self.tracked = None;
        self.last_timestamp = None;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.reset()
    }
}
