//! Keypoint block layout and model keypoint selection.
//!
//! A frame row is the concatenation `[right hand, left hand, face, pose]`.
//! With the full layout that is `2 * 21 + 478 + 33 = 553` keypoints.

use std::ops::Range;

use anyhow::{Result, anyhow};

pub const HAND_POINTS: usize = 21;
pub const FACE_MESH_POINTS: usize = 478;
pub const POSE_POINTS: usize = 33;

/// Lip contour and chin points used by the curated selection.
pub const CURATED_FACE: [usize; 11] = [291, 267, 37, 61, 84, 314, 310, 13, 80, 14, 152];
/// Eyes, ears, shoulders, elbows and wrists.
pub const CURATED_POSE: [usize; 10] = [2, 5, 7, 8, 11, 12, 13, 14, 15, 16];

const POSE_MIRROR_PAIRS: &[(usize, usize)] = &[
    (1, 4),
    (2, 5),
    (3, 6),
    (7, 8),
    (9, 10),
    (11, 12),
    (13, 14),
    (15, 16),
    (17, 18),
    (19, 20),
    (21, 22),
    (23, 24),
    (25, 26),
    (27, 28),
    (29, 30),
    (31, 32),
];

// Only these face mesh points have a tabulated partner. Mirroring is
// faithful for them and for FACE_AXIS_POINTS; any other face point would
// map onto itself, so selections containing one cannot be mirrored.
const FACE_MIRROR_PAIRS: &[(usize, usize)] = &[
    (61, 291),
    (37, 267),
    (84, 314),
    (80, 310),
    (33, 263),
    (133, 362),
    (234, 454),
    (468, 473),
];

/// Face mesh points on the vertical symmetry axis (nose ridge, lip centers,
/// chin, forehead).
const FACE_AXIS_POINTS: &[usize] = &[
    0, 1, 2, 4, 5, 6, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 94, 151, 152, 164, 168, 175,
    195, 197, 199, 200,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LandmarkSubset {
    /// Every landmark the detector produces, in detector order.
    All(usize),
    /// Only these detector landmark indices, in this order.
    Indices(Vec<usize>),
}

impl LandmarkSubset {
    pub fn len(&self) -> usize {
        match self {
            LandmarkSubset::All(n) => *n,
            LandmarkSubset::Indices(idx) => idx.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detector landmark index stored at block position `pos`.
    pub fn source_index(&self, pos: usize) -> Option<usize> {
        match self {
            LandmarkSubset::All(n) => (pos < *n).then_some(pos),
            LandmarkSubset::Indices(idx) => idx.get(pos).copied(),
        }
    }

    /// Block position holding detector landmark `source`.
    pub fn position_of(&self, source: usize) -> Option<usize> {
        match self {
            LandmarkSubset::All(n) => (source < *n).then_some(source),
            LandmarkSubset::Indices(idx) => idx.iter().position(|&s| s == source),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeypointLayout {
    pub face: LandmarkSubset,
    pub pose: LandmarkSubset,
}

impl Default for KeypointLayout {
    fn default() -> Self {
        Self::full()
    }
}

impl KeypointLayout {
    pub fn full() -> Self {
        Self {
            face: LandmarkSubset::All(FACE_MESH_POINTS),
            pose: LandmarkSubset::All(POSE_POINTS),
        }
    }

    /// Keeps only the curated face and pose points.
    pub fn compact() -> Self {
        Self {
            face: LandmarkSubset::Indices(CURATED_FACE.to_vec()),
            pose: LandmarkSubset::Indices(CURATED_POSE.to_vec()),
        }
    }

    pub fn hand_len(&self) -> usize {
        HAND_POINTS * 2
    }

    pub fn face_len(&self) -> usize {
        self.face.len()
    }

    pub fn pose_len(&self) -> usize {
        self.pose.len()
    }

    pub fn total(&self) -> usize {
        self.hand_len() + self.face_len() + self.pose_len()
    }

    pub fn hand_range(&self) -> Range<usize> {
        0..self.hand_len()
    }

    pub fn face_range(&self) -> Range<usize> {
        let start = self.hand_len();
        start..start + self.face_len()
    }

    pub fn pose_range(&self) -> Range<usize> {
        let start = self.hand_len() + self.face_len();
        start..start + self.pose_len()
    }

    /// Index of the keypoint that lands at `idx` after a horizontal mirror.
    ///
    /// The mapping is an involution: mirroring twice returns `idx`.
    pub fn mirror_index(&self, idx: usize) -> usize {
        if self.hand_range().contains(&idx) {
            return (idx + HAND_POINTS) % self.hand_len();
        }
        if self.face_range().contains(&idx) {
            let base = self.face_range().start;
            return mirror_within(&self.face, FACE_MIRROR_PAIRS, idx - base)
                .map_or(idx, |pos| base + pos);
        }
        if self.pose_range().contains(&idx) {
            let base = self.pose_range().start;
            return mirror_within(&self.pose, POSE_MIRROR_PAIRS, idx - base)
                .map_or(idx, |pos| base + pos);
        }
        idx
    }

    /// False for face rows whose mirror partner is unknown.
    pub fn mirrors_faithfully(&self, idx: usize) -> bool {
        if !self.face_range().contains(&idx) {
            return true;
        }
        let Some(source) = self.face.source_index(idx - self.face_range().start) else {
            return false;
        };
        FACE_AXIS_POINTS.contains(&source)
            || FACE_MIRROR_PAIRS.iter().any(|&(a, b)| {
                let partner = match source {
                    s if s == a => b,
                    s if s == b => a,
                    _ => return false,
                };
                self.face.position_of(partner).is_some()
            })
    }

    /// Absolute row index of detector landmark `source` within the face block.
    pub fn face_index(&self, source: usize) -> Option<usize> {
        self.face
            .position_of(source)
            .map(|pos| self.face_range().start + pos)
    }

    /// Absolute row index of detector landmark `source` within the pose block.
    pub fn pose_index(&self, source: usize) -> Option<usize> {
        self.pose
            .position_of(source)
            .map(|pos| self.pose_range().start + pos)
    }
}

fn mirror_within(
    subset: &LandmarkSubset,
    pairs: &[(usize, usize)],
    pos: usize,
) -> Option<usize> {
    let source = subset.source_index(pos)?;
    let partner = pairs.iter().find_map(|&(a, b)| {
        if a == source {
            Some(b)
        } else if b == source {
            Some(a)
        } else {
            None
        }
    })?;
    subset.position_of(partner)
}

/// Ordered keypoint indices fed to the model, with the indices to use
/// instead when the clip is mirrored left/right.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedKeypoints {
    indices: Vec<usize>,
    flipped: Option<Vec<usize>>,
}

impl SelectedKeypoints {
    pub fn new(indices: Vec<usize>, flipped: Option<Vec<usize>>) -> Result<Self> {
        if let Some(flipped) = &flipped {
            if flipped.len() != indices.len() {
                return Err(anyhow!(
                    "flipped keypoint list has {} entries, expected {}",
                    flipped.len(),
                    indices.len()
                ));
            }
        }
        Ok(Self { indices, flipped })
    }

    /// Every keypoint of the layout, in row order, without a mirror mapping.
    pub fn all(layout: &KeypointLayout) -> Self {
        Self {
            indices: (0..layout.total()).collect(),
            flipped: None,
        }
    }

    /// Both hands, the curated lip/chin points and the curated upper-body points.
    pub fn curated(layout: &KeypointLayout) -> Result<Self> {
        let mut indices: Vec<usize> = layout.hand_range().collect();
        for source in CURATED_FACE {
            let idx = layout
                .face_index(source)
                .ok_or_else(|| anyhow!("face landmark {source} is not part of the layout"))?;
            indices.push(idx);
        }
        for source in CURATED_POSE {
            let idx = layout
                .pose_index(source)
                .ok_or_else(|| anyhow!("pose landmark {source} is not part of the layout"))?;
            indices.push(idx);
        }
        Ok(Self {
            indices,
            flipped: None,
        })
    }

    /// Attaches the mirror mapping derived from the layout.
    ///
    /// Fails when a selected face point has no known mirror partner, which
    /// rules out most of the full face mesh.
    pub fn with_mirror(mut self, layout: &KeypointLayout) -> Result<Self> {
        if let Some(&idx) = self.indices.iter().find(|&&idx| !layout.mirrors_faithfully(idx)) {
            return Err(anyhow!(
                "keypoint {idx} has no mirror partner; mirroring needs a curated face selection"
            ));
        }
        let flipped = self
            .indices
            .iter()
            .map(|&idx| layout.mirror_index(idx))
            .collect();
        self.flipped = Some(flipped);
        Ok(self)
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn flipped(&self) -> Option<&[usize]> {
        self.flipped.as_deref()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Swaps the primary and flipped index lists.
    ///
    /// Returns `None` when no mirror mapping is attached.
    pub fn mirrored(&self) -> Option<Self> {
        let flipped = self.flipped.clone()?;
        Some(Self {
            indices: flipped,
            flipped: Some(self.indices.clone()),
        })
    }

    pub fn max_index(&self) -> Option<usize> {
        self.indices
            .iter()
            .chain(self.flipped.iter().flatten())
            .copied()
            .max()
    }
}
