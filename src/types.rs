use anyhow::{Result, anyhow};

/// Coordinate value marking a keypoint the detector did not find.
pub const SENTINEL: f32 = -1.0;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected_len = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(4);
        if rgba.len() != expected_len {
            return Err(anyhow!(
                "frame buffer size mismatch: got {}, expected {}",
                rgba.len(),
                expected_len
            ));
        }
        Ok(Self {
            rgba,
            width,
            height,
        })
    }

    /// Mirrors the frame along its horizontal axis (top row becomes bottom row).
    pub fn flip_vertical(&mut self) {
        let stride = self.width as usize * 4;
        let rows = self.height as usize;
        for row in 0..rows / 2 {
            let (top, bottom) = self.rgba.split_at_mut((rows - 1 - row) * stride);
            top[row * stride..(row + 1) * stride].swap_with_slice(&mut bottom[..stride]);
        }
    }
}

/// A decoded clip: ordered, equally sized frames plus the rate they were captured at.
#[derive(Clone, Debug)]
pub struct Video {
    pub frames: Vec<Frame>,
    pub fps: f32,
}

impl Video {
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.frames.first().map(|f| (f.width, f.height))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Keypoint {
    pub const MISSING: Keypoint = Keypoint {
        x: SENTINEL,
        y: SENTINEL,
        z: SENTINEL,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// A keypoint is present only when none of its coordinates is the sentinel.
    pub fn is_present(&self) -> bool {
        self.x != SENTINEL && self.y != SENTINEL && self.z != SENTINEL
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f32; 3]> for Keypoint {
    fn from(v: [f32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    /// Hand estimators report the probability of a right hand.
    pub fn from_score(score: f32) -> Self {
        if score >= 0.5 {
            Handedness::Right
        } else {
            Handedness::Left
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Handedness::Left => "left",
            Handedness::Right => "right",
        }
    }
}

/// Keypoints of one video frame, grouped by body region.
///
/// The `hands` block holds the right hand first and the left hand second.
/// Undetected regions stay filled with [`Keypoint::MISSING`].
#[derive(Clone, Debug, PartialEq)]
pub struct FrameKeypoints {
    pub hands: Vec<Keypoint>,
    pub face: Vec<Keypoint>,
    pub pose: Vec<Keypoint>,
}

impl FrameKeypoints {
    pub fn missing(hand_points: usize, face_points: usize, pose_points: usize) -> Self {
        Self {
            hands: vec![Keypoint::MISSING; hand_points],
            face: vec![Keypoint::MISSING; face_points],
            pose: vec![Keypoint::MISSING; pose_points],
        }
    }

    pub fn len(&self) -> usize {
        self.hands.len() + self.face.len() + self.pose.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenated view in block order: hands, face, pose.
    pub fn iter(&self) -> impl Iterator<Item = &Keypoint> {
        self.hands.iter().chain(self.face.iter()).chain(self.pose.iter())
    }

    pub fn present_count(&self) -> usize {
        self.iter().filter(|kp| kp.is_present()).count()
    }
}
