//! Resamples a raw keypoint sequence to a fixed length, optionally augments
//! it, and selects the keypoints the model consumes.
//!
//! Augmentation runs on pixel coordinates in a fixed order: mirror,
//! rotation, crop, jitter, frame drop. The selected keypoints are then
//! scaled back to `[0, 1]` by the (possibly cropped) frame size.

use std::ops::Range;

use ndarray::{Array2, Array3, Axis, s};
use rand::Rng;

use crate::{
    error::{RecognitionError, Result},
    extractor::{KeypointSequence, validity},
    layout::{KeypointLayout, SelectedKeypoints},
    types::SENTINEL,
};

const MAX_ROTATION_DEG: f32 = 15.0;
const MAX_CROP_SHRINK: f32 = 0.3;
const MAX_CROP_SHIFT: f32 = 0.3;
const WINDOW_END_JITTER: i64 = 15;
const UPSAMPLE_SHIFT: i64 = 10;

#[derive(Clone, Debug)]
pub struct SampleOptions {
    pub target_length: usize,
    pub augment: bool,
    /// Allow the left/right mirror step when the selection carries a
    /// flipped index list.
    pub mirror: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            target_length: 64,
            augment: false,
            mirror: false,
        }
    }
}

/// Model input for one clip: `(T, K, 3)` keypoints in `[0, 1]` image
/// coordinates and the matching `(T, K)` validity mask.
///
/// `valid[t, k]` is true exactly when no coordinate of `keypoints[t, k]`
/// is the sentinel.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub keypoints: Array3<f32>,
    pub valid: Array2<bool>,
}

impl Sample {
    fn empty(frames: usize, keypoints: usize) -> Self {
        Self {
            keypoints: Array3::zeros((frames, keypoints, 3)),
            valid: Array2::from_elem((frames, keypoints), false),
        }
    }

    /// True when the keypoint tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn frames(&self) -> usize {
        self.keypoints.len_of(Axis(0))
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len_of(Axis(1))
    }
}

fn linspace(start: f64, end: f64, n: usize) -> impl Iterator<Item = i64> {
    (0..n).map(move |i| {
        let v = if n == 1 {
            start
        } else {
            start + (end - start) * i as f64 / (n - 1) as f64
        };
        v as i64
    })
}

/// Picks `target` frame indices in `[0, length - 1]`.
///
/// Without augmentation a longer clip yields its centered window and a
/// shorter one is stretched by repeating frames. With augmentation the
/// window start is random and its end jittered by up to 15 frames, while a
/// stretched clip is shifted as a whole by up to 10 frames.
pub fn sample_indices<R: Rng + ?Sized>(
    length: usize,
    target: usize,
    augment: bool,
    rng: &mut R,
) -> Vec<usize> {
    if length == 0 || target == 0 {
        return Vec::new();
    }
    let last = length as i64 - 1;

    let raw: Vec<i64> = if length > target {
        if augment {
            let start = rng.gen_range(0..=length - target) as i64;
            let end = start + target as i64 + rng.gen_range(-WINDOW_END_JITTER..=WINDOW_END_JITTER);
            linspace(start as f64, end as f64, target).collect()
        } else {
            let start = (length / 2 - target / 2) as i64;
            (start..start + target as i64).collect()
        }
    } else {
        let shift = if augment {
            rng.gen_range(-UPSAMPLE_SHIFT..=UPSAMPLE_SHIFT)
        } else {
            0
        };
        linspace(0.0, last as f64, target).map(|i| i + shift).collect()
    };

    raw.into_iter().map(|i| i.clamp(0, last) as usize).collect()
}

/// Builds one model sample from `seq`.
///
/// The raw sequence must follow `layout`; frame-drop regions come from it.
/// Entries that end up invalid are written as the sentinel.
pub fn process_keypoints<R: Rng + ?Sized>(
    seq: &KeypointSequence,
    selection: &SelectedKeypoints,
    layout: &KeypointLayout,
    opts: &SampleOptions,
    rng: &mut R,
) -> Result<Sample> {
    let total = seq.num_keypoints();
    if total != layout.total() {
        return Err(RecognitionError::InvalidConfig(format!(
            "sequence has {total} keypoints per frame, layout expects {}",
            layout.total()
        )));
    }
    if let Some(max) = selection.max_index() {
        if max >= total {
            return Err(RecognitionError::InvalidConfig(format!(
                "selected keypoint {max} is out of range for {total} keypoints"
            )));
        }
    }

    let indices = sample_indices(seq.len(), opts.target_length, opts.augment, rng);
    if indices.is_empty() || selection.is_empty() {
        return Ok(Sample::empty(indices.len(), selection.len()));
    }

    let mut keypoints = seq.keypoints.select(Axis(0), &indices);
    let mut valid = validity(&keypoints);
    let mut width = seq.width as f32;
    let mut height = seq.height as f32;
    let mut chosen = selection.indices();

    if opts.augment {
        if let Some(flipped) = selection.flipped().filter(|_| opts.mirror) {
            if rng.gen_bool(0.5) {
                mirror_x(&mut keypoints, width);
                chosen = flipped;
            }
        }
        rotate(
            &mut keypoints,
            (width / 2.0, height / 2.0),
            MAX_ROTATION_DEG.to_radians(),
            rng,
        );
        let (crop_w, crop_h) = crop(&mut keypoints, seq.width, seq.height, rng);
        width = crop_w as f32;
        height = crop_h as f32;
        jitter(&mut keypoints, height / 180.0, rng);
        frame_drop(
            &mut valid,
            [layout.hand_range(), layout.face_range(), layout.pose_range()],
            rng,
        );
    }

    let mut keypoints = keypoints.select(Axis(1), chosen);
    let valid = valid.select(Axis(1), chosen);
    let scale = [1.0 / width, 1.0 / height, 1.0];
    for mut point in keypoints.lanes_mut(Axis(2)) {
        for (v, s) in point.iter_mut().zip(scale) {
            *v *= s;
        }
    }

    let mut final_valid = valid;
    for ((t, k), ok) in final_valid.indexed_iter_mut() {
        let mut point = keypoints.slice_mut(s![t, k, ..]);
        if *ok && point.iter().all(|&v| v != SENTINEL) {
            continue;
        }
        *ok = false;
        point.fill(SENTINEL);
    }

    log::debug!(
        "sampled {} of {} frames, {} valid entries",
        indices.len(),
        seq.len(),
        final_valid.iter().filter(|&&v| v).count()
    );

    Ok(Sample {
        keypoints,
        valid: final_valid,
    })
}

/// Mirrors x around the frame width.
pub fn mirror_x(keypoints: &mut Array3<f32>, width: f32) {
    keypoints
        .slice_mut(s![.., .., 0])
        .mapv_inplace(|x| width - x);
}

/// Rotates x/y of every frame by its own angle in `[-max_angle, max_angle]`.
pub fn rotate<R: Rng + ?Sized>(
    keypoints: &mut Array3<f32>,
    center: (f32, f32),
    max_angle: f32,
    rng: &mut R,
) {
    for mut frame in keypoints.outer_iter_mut() {
        let angle = (rng.r#gen::<f32>() * 2.0 - 1.0) * max_angle;
        let (sin, cos) = angle.sin_cos();
        for mut point in frame.outer_iter_mut() {
            let x = point[0] - center.0;
            let y = point[1] - center.1;
            point[0] = x * cos - y * sin + center.0;
            point[1] = x * sin + y * cos + center.1;
        }
    }
}

/// Moves x/y into a random sub-rectangle of the frame and returns its size.
pub fn crop<R: Rng + ?Sized>(
    keypoints: &mut Array3<f32>,
    width: u32,
    height: u32,
    rng: &mut R,
) -> (u32, u32) {
    let mut axis = |size: u32| {
        let size = size as i64;
        let shrink = rng.gen_range(0.0..=MAX_CROP_SHRINK);
        let cropped = ((size as f32 * (1.0 - shrink)) as i64).max(1);
        let max_shift = (MAX_CROP_SHIFT * size as f32) as i64;
        let start = size / 2 - cropped / 2 + rng.gen_range(-max_shift..=max_shift);
        (cropped, start)
    };
    let (crop_w, start_w) = axis(width);
    let (crop_h, start_h) = axis(height);

    keypoints
        .slice_mut(s![.., .., 0])
        .mapv_inplace(|x| x - start_w as f32);
    keypoints
        .slice_mut(s![.., .., 1])
        .mapv_inplace(|y| y - start_h as f32);

    (crop_w as u32, crop_h as u32)
}

/// Per-point additive noise, then per-frame scale and shift.
///
/// Applied to every entry, sentinel or not; invalid entries are masked
/// afterwards.
pub fn jitter<R: Rng + ?Sized>(keypoints: &mut Array3<f32>, noise: f32, rng: &mut R) {
    for mut frame in keypoints.outer_iter_mut() {
        for mut point in frame.outer_iter_mut() {
            if noise > 0.0 {
                point[0] += rng.gen_range(-noise..noise);
                point[1] += rng.gen_range(-noise..noise);
            }
            point[2] += rng.gen_range(-0.004..0.004);
        }

        let scale_x = rng.gen_range(0.9..1.1);
        let scale_y = rng.gen_range(0.9..1.1);
        let scale_z = rng.gen_range(0.9..1.1);
        let shift_x = rng.gen_range(-0.1..0.1);
        let shift_y = rng.gen_range(-0.1..0.1);
        for mut point in frame.outer_iter_mut() {
            point[0] = point[0] * scale_x + shift_x;
            point[1] = point[1] * scale_y + shift_y;
            point[2] *= scale_z;
        }
    }
}

/// Drops validity: 10% of single entries, each region of a frame with 10%
/// probability, pose for the whole clip with 10% and face with 50%.
///
/// `regions` is `[hands, face, pose]`.
pub fn frame_drop<R: Rng + ?Sized>(
    valid: &mut Array2<bool>,
    regions: [Range<usize>; 3],
    rng: &mut R,
) {
    for v in valid.iter_mut() {
        if rng.r#gen::<f32>() < 0.1 {
            *v = false;
        }
    }

    for mut frame in valid.outer_iter_mut() {
        for region in &regions {
            if rng.r#gen::<f32>() < 0.1 {
                frame.slice_mut(s![region.clone()]).fill(false);
            }
        }
    }

    let [_, face, pose] = regions;
    if rng.r#gen::<f32>() < 0.1 {
        valid.slice_mut(s![.., pose]).fill(false);
    }
    if rng.r#gen::<f32>() < 0.5 {
        valid.slice_mut(s![.., face]).fill(false);
    }
}
