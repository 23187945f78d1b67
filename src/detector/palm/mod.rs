mod anchors;

use std::{cmp::Ordering, f32::consts::PI, path::Path};

use anyhow::{Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use self::anchors::{NUM_ANCHORS, anchors};
use super::common::{LetterboxInfo, bounds, load_session, prepare_frame_with_size, sigmoid};
use crate::types::Frame;

pub const PALM_INPUT_SIZE: u32 = 192;
const PALM_LANDMARKS: usize = 7;

#[derive(Clone, Debug)]
pub struct PalmDetectorConfig {
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub top_k: usize,
}

impl Default for PalmDetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.3,
            top_k: 32,
        }
    }
}

/// A palm box and its seven palm keypoints, in frame pixels.
#[derive(Clone, Debug)]
pub struct PalmRegion {
    pub bbox: [f32; 4],
    pub landmarks: Vec<(f32, f32)>,
    pub score: f32,
}

/// Square, rotated hand crop derived from a palm region.
#[derive(Clone, Copy, Debug)]
pub struct HandRoi {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
}

pub struct PalmDetector {
    session: Session,
    cfg: PalmDetectorConfig,
}

impl PalmDetector {
    pub fn new(model_path: &Path, cfg: PalmDetectorConfig, intra_threads: usize) -> Result<Self> {
        let session = load_session(model_path, intra_threads)?;
        Ok(Self { session, cfg })
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<PalmRegion>> {
        let (input, letterbox) = prepare_frame_with_size(frame, PALM_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self.session.run(ort::inputs![tensor])?;
        if outputs.len() < 2 {
            return Err(anyhow!(
                "palm detector returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let boxes = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;
        let box_shape = boxes.shape().to_vec();
        let score_shape = scores.shape().to_vec();
        let boxes: Vec<f32> = boxes.iter().copied().collect();
        let scores: Vec<f32> = scores.iter().copied().collect();

        decode_palms(&boxes, &box_shape, &scores, &score_shape, &letterbox, &self.cfg)
    }
}

fn last_two(shape: &[usize]) -> Result<(usize, usize)> {
    if shape.len() < 2 {
        return Err(anyhow!("unexpected palm output shape {shape:?}"));
    }
    Ok((shape[shape.len() - 2], shape[shape.len() - 1]))
}

fn decode_palms(
    boxes: &[f32],
    box_shape: &[usize],
    scores: &[f32],
    score_shape: &[usize],
    letterbox: &LetterboxInfo,
    cfg: &PalmDetectorConfig,
) -> Result<Vec<PalmRegion>> {
    let (anchor_dim, feature_dim) = last_two(box_shape)?;
    let (score_anchor_dim, score_feature_dim) = last_two(score_shape)?;

    if feature_dim < 4 + PALM_LANDMARKS * 2 {
        return Err(anyhow!("palm box feature dimension too small: {feature_dim}"));
    }
    if anchor_dim != score_anchor_dim {
        return Err(anyhow!(
            "anchor dimension mismatch between boxes ({anchor_dim}) and scores ({score_anchor_dim})"
        ));
    }

    let anchor_table = anchors();
    let count = NUM_ANCHORS.min(anchor_dim);
    let input = PALM_INPUT_SIZE as f32;
    let scale = letterbox.orig_w.max(letterbox.orig_h) as f32;
    let bias_x = letterbox.pad_x / letterbox.scale;
    let bias_y = letterbox.pad_y / letterbox.scale;
    let to_frame = |ax: f32, ay: f32, dx: f32, dy: f32| {
        (
            (dx / input + ax) * scale - bias_x,
            (dy / input + ay) * scale - bias_y,
        )
    };

    let mut candidates = Vec::new();
    for idx in 0..count {
        let raw_score = *scores
            .get(idx * score_feature_dim)
            .ok_or_else(|| anyhow!("missing score for palm anchor {idx}"))?;
        let score = sigmoid(raw_score);
        if score < cfg.score_threshold {
            continue;
        }

        let feat = boxes
            .get(idx * feature_dim..idx * feature_dim + 4 + PALM_LANDMARKS * 2)
            .ok_or_else(|| anyhow!("missing box features for palm anchor {idx}"))?;
        let [ax, ay] = anchor_table[idx];

        let (cx, cy) = to_frame(ax, ay, feat[0], feat[1]);
        let hw = feat[2] / input * scale / 2.0;
        let hh = feat[3] / input * scale / 2.0;
        if hw <= 0.0 || hh <= 0.0 {
            continue;
        }

        let max_w = letterbox.orig_w as f32;
        let max_h = letterbox.orig_h as f32;
        let bbox = [
            (cx - hw).clamp(0.0, max_w),
            (cy - hh).clamp(0.0, max_h),
            (cx + hw).clamp(0.0, max_w),
            (cy + hh).clamp(0.0, max_h),
        ];

        let landmarks = feat[4..]
            .chunks_exact(2)
            .map(|p| to_frame(ax, ay, p[0], p[1]))
            .collect();

        candidates.push(PalmRegion {
            bbox,
            landmarks,
            score,
        });
    }

    let kept = nms(&candidates, cfg.nms_threshold, cfg.top_k);
    Ok(kept.into_iter().map(|i| candidates[i].clone()).collect())
}

impl PalmRegion {
    /// Hand crop around the palm, expanded to cover the fingers and rotated
    /// so the wrist-to-middle-finger axis points up.
    pub fn hand_roi(&self) -> HandRoi {
        let center = if self.landmarks.is_empty() {
            (
                (self.bbox[0] + self.bbox[2]) * 0.5,
                (self.bbox[1] + self.bbox[3]) * 0.5,
            )
        } else {
            let n = self.landmarks.len() as f32;
            let (sx, sy) = self
                .landmarks
                .iter()
                .fold((0.0_f32, 0.0_f32), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };

        let base = (self.bbox[2] - self.bbox[0])
            .abs()
            .max((self.bbox[3] - self.bbox[1]).abs());
        let span = bounds(&self.landmarks)
            .map(|(x0, y0, x1, y1)| (x1 - x0).max(y1 - y0))
            .unwrap_or(0.0);
        let side = base.max(span).max(80.0) * 2.4;

        HandRoi {
            center,
            side,
            angle: self.orientation(),
        }
    }

    /// Rotation that brings the palm upright, from the wrist (landmark 0)
    /// towards the middle finger base (landmark 2).
    fn orientation(&self) -> f32 {
        match (self.landmarks.first(), self.landmarks.get(2)) {
            (Some(wrist), Some(middle)) => {
                let dx = middle.0 - wrist.0;
                let dy = middle.1 - wrist.1;
                if dx.abs() < 1e-6 && dy.abs() < 1e-6 {
                    0.0
                } else {
                    dy.atan2(dx) + PI * 0.5
                }
            }
            _ => 0.0,
        }
    }
}

fn nms(candidates: &[PalmRegion], threshold: f32, top_k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| {
        candidates[*b]
            .score
            .partial_cmp(&candidates[*a].score)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    'outer: for &idx in &order {
        for &k in &keep {
            if iou(&candidates[idx].bbox, &candidates[k].bbox) >= threshold {
                continue 'outer;
            }
        }
        keep.push(idx);
        if keep.len() >= top_k {
            break;
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(bbox: [f32; 4], score: f32) -> PalmRegion {
        PalmRegion {
            bbox,
            landmarks: Vec::new(),
            score,
        }
    }

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let candidates = vec![
            region([0.0, 0.0, 10.0, 10.0], 0.6),
            region([1.0, 1.0, 11.0, 11.0], 0.9),
            region([50.0, 50.0, 60.0, 60.0], 0.7),
        ];
        assert_eq!(nms(&candidates, 0.3, 10), vec![1, 2]);
        assert_eq!(nms(&candidates, 0.3, 1), vec![1]);
    }

    #[test]
    fn upright_palm_has_no_rotation() {
        let palm = PalmRegion {
            bbox: [40.0, 40.0, 60.0, 80.0],
            landmarks: vec![(50.0, 80.0), (45.0, 60.0), (50.0, 40.0)],
            score: 0.9,
        };
        let roi = palm.hand_roi();
        assert!(roi.angle.abs() < 1e-5);
        assert!(roi.side >= 80.0 * 2.4);
    }

    #[test]
    fn decode_keeps_confident_anchor() {
        let letterbox = LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: 192,
            orig_h: 192,
        };
        let features = 4 + PALM_LANDMARKS * 2;
        let anchors_n = 4;
        let mut boxes = vec![0.0f32; anchors_n * features];
        boxes[2 * features + 2] = 20.0;
        boxes[2 * features + 3] = 20.0;
        let mut scores = vec![-10.0f32; anchors_n];
        scores[2] = 10.0;

        let palms = decode_palms(
            &boxes,
            &[1, anchors_n, features],
            &scores,
            &[1, anchors_n, 1],
            &letterbox,
            &PalmDetectorConfig::default(),
        )
        .unwrap();
        assert_eq!(palms.len(), 1);
        let [x0, _, x1, _] = palms[0].bbox;
        assert!((x1 - x0 - 20.0).abs() < 1e-3);
        assert_eq!(palms[0].landmarks.len(), PALM_LANDMARKS);
    }
}
