//! Uniform per-frame access to the hand, face and pose landmark detectors.
//!
//! Detectors report landmarks in normalized image coordinates (`[0, 1]` for
//! x and y, detector-relative depth for z). [`LandmarkAdapter`] folds their
//! outputs into one fixed-size [`FrameKeypoints`] record per frame.

pub mod common;
mod face;
mod hand;
mod palm;
mod pose;

use std::path::PathBuf;

use anyhow::Result;

pub use self::face::{FaceLandmarkerConfig, OrtFaceLandmarker};
pub use self::hand::{HandLandmarkerConfig, OrtHandLandmarker};
pub use self::palm::{PalmDetectorConfig, PalmRegion};
pub use self::pose::{OrtPoseLandmarker, PoseLandmarkerConfig};

use crate::{
    error::RecognitionError,
    layout::{HAND_POINTS, KeypointLayout},
    model_download::{self, ModelKind},
    types::{Frame, FrameKeypoints, Handedness, Keypoint},
};

#[derive(Clone, Debug)]
pub struct HandDetection {
    pub landmarks: Vec<Keypoint>,
    pub handedness: Handedness,
    pub score: f32,
}

#[derive(Clone, Debug)]
pub struct FaceDetection {
    pub landmarks: Vec<Keypoint>,
    pub score: f32,
}

#[derive(Clone, Debug)]
pub struct PoseDetection {
    pub landmarks: Vec<Keypoint>,
    pub score: f32,
}

pub trait HandLandmarker: Send {
    fn detect(&mut self, frame: &Frame, timestamp_ms: u64) -> Result<Vec<HandDetection>>;

    /// Forgets per-video tracking state; timestamps restart after this.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait FaceLandmarker: Send {
    /// `pose` is this frame's pose result, usable as a hint for locating the face.
    fn detect(
        &mut self,
        frame: &Frame,
        timestamp_ms: u64,
        pose: Option<&PoseDetection>,
    ) -> Result<Vec<FaceDetection>>;

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait PoseLandmarker: Send {
    fn detect(&mut self, frame: &Frame, timestamp_ms: u64) -> Result<Option<PoseDetection>>;

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub palm_model: PathBuf,
    pub handpose_model: PathBuf,
    pub face_model: PathBuf,
    pub pose_model: PathBuf,
    pub hand: HandLandmarkerConfig,
    pub face: FaceLandmarkerConfig,
    pub pose: PoseLandmarkerConfig,
    pub intra_threads: usize,
    /// Fetch missing models that have a known download location.
    pub download_missing: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            palm_model: ModelKind::PalmDetector.default_path(),
            handpose_model: ModelKind::HandposeEstimator.default_path(),
            face_model: ModelKind::FaceLandmarker.default_path(),
            pose_model: ModelKind::PoseLandmarker.default_path(),
            hand: HandLandmarkerConfig::default(),
            face: FaceLandmarkerConfig::default(),
            pose: PoseLandmarkerConfig::default(),
            intra_threads: 2,
            download_missing: true,
        }
    }
}

pub struct LandmarkAdapter {
    hands: Box<dyn HandLandmarker>,
    face: Box<dyn FaceLandmarker>,
    pose: Box<dyn PoseLandmarker>,
    layout: KeypointLayout,
    closed: bool,
}

impl LandmarkAdapter {
    pub fn new(
        hands: Box<dyn HandLandmarker>,
        face: Box<dyn FaceLandmarker>,
        pose: Box<dyn PoseLandmarker>,
        layout: KeypointLayout,
    ) -> Self {
        Self {
            hands,
            face,
            pose,
            layout,
            closed: false,
        }
    }

    /// Builds the ONNX Runtime detectors. Any failure here is fatal.
    pub fn from_config(
        cfg: &DetectorConfig,
        layout: KeypointLayout,
    ) -> Result<Self, RecognitionError> {
        let init = || -> Result<Self> {
            for (kind, path) in [
                (ModelKind::PalmDetector, &cfg.palm_model),
                (ModelKind::HandposeEstimator, &cfg.handpose_model),
                (ModelKind::FaceLandmarker, &cfg.face_model),
                (ModelKind::PoseLandmarker, &cfg.pose_model),
            ] {
                model_download::ensure_model_ready(kind, path, cfg.download_missing)?;
            }

            let hands = OrtHandLandmarker::new(
                &cfg.palm_model,
                &cfg.handpose_model,
                cfg.hand.clone(),
                cfg.intra_threads,
            )?;
            let face = OrtFaceLandmarker::new(&cfg.face_model, cfg.face.clone(), cfg.intra_threads)?;
            let pose = OrtPoseLandmarker::new(&cfg.pose_model, cfg.pose.clone(), cfg.intra_threads)?;

            Ok(Self::new(
                Box::new(hands),
                Box::new(face),
                Box::new(pose),
                layout.clone(),
            ))
        };

        init().map_err(|err| RecognitionError::DetectorInit(format!("{err:#}")))
    }

    pub fn layout(&self) -> &KeypointLayout {
        &self.layout
    }

    pub fn missing_frame(&self) -> FrameKeypoints {
        FrameKeypoints::missing(
            self.layout.hand_len(),
            self.layout.face_len(),
            self.layout.pose_len(),
        )
    }

    /// Prepares the detectors for a new clip whose timestamps start over.
    /// Must be called before the first frame of every clip.
    pub fn begin_clip(&mut self) {
        if let Err(err) = self.hands.reset() {
            log::warn!("failed to reset hand landmarker: {err:#}");
        }
        if let Err(err) = self.face.reset() {
            log::warn!("failed to reset face landmarker: {err:#}");
        }
        if let Err(err) = self.pose.reset() {
            log::warn!("failed to reset pose landmarker: {err:#}");
        }
    }

    /// Runs all three detectors on one frame. Undetected regions are filled
    /// with the sentinel; a detector error aborts the whole frame.
    pub fn try_detect(&mut self, frame: &Frame, timestamp_ms: u64) -> Result<FrameKeypoints> {
        let pose = self.pose.detect(frame, timestamp_ms)?;
        let hands = self.hands.detect(frame, timestamp_ms)?;
        let faces = self.face.detect(frame, timestamp_ms, pose.as_ref())?;
        Ok(self.assemble(&hands, faces.first(), pose.as_ref()))
    }

    /// Like [`Self::try_detect`] but never fails: a detector error is logged
    /// and the frame is reported with every region undetected.
    pub fn detect(&mut self, frame: &Frame, timestamp_ms: u64) -> FrameKeypoints {
        match self.try_detect(frame, timestamp_ms) {
            Ok(keypoints) => keypoints,
            Err(err) => {
                log::warn!("landmark detection failed at {timestamp_ms} ms: {err:#}");
                self.missing_frame()
            }
        }
    }

    fn assemble(
        &self,
        hands: &[HandDetection],
        face: Option<&FaceDetection>,
        pose: Option<&PoseDetection>,
    ) -> FrameKeypoints {
        let mut out = self.missing_frame();

        for hand in hands {
            let offset = match hand.handedness {
                Handedness::Right => 0,
                Handedness::Left => HAND_POINTS,
            };
            for (slot, kp) in out.hands[offset..offset + HAND_POINTS]
                .iter_mut()
                .zip(&hand.landmarks)
            {
                *slot = *kp;
            }
        }

        if let Some(face) = face {
            for (pos, slot) in out.face.iter_mut().enumerate() {
                if let Some(kp) = self
                    .layout
                    .face
                    .source_index(pos)
                    .and_then(|src| face.landmarks.get(src))
                {
                    *slot = *kp;
                }
            }
        }

        if let Some(pose) = pose {
            for (pos, slot) in out.pose.iter_mut().enumerate() {
                if let Some(kp) = self
                    .layout
                    .pose
                    .source_index(pos)
                    .and_then(|src| pose.landmarks.get(src))
                {
                    *slot = *kp;
                }
            }
        }

        out
    }

    /// Releases every detector. Close errors are logged and swallowed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.hands.close() {
            log::warn!("failed to close hand landmarker: {err:#}");
        }
        if let Err(err) = self.face.close() {
            log::warn!("failed to close face landmarker: {err:#}");
        }
        if let Err(err) = self.pose.close() {
            log::warn!("failed to close pose landmarker: {err:#}");
        }
    }
}

impl Drop for LandmarkAdapter {
    fn drop(&mut self) {
        self.close();
    }
}
