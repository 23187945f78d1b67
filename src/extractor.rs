//! Drives the landmark adapter across a video and produces the raw keypoint
//! sequence in pixel coordinates.

use std::time::Instant;

use anyhow::Result as AnyResult;
use ndarray::{Array2, Array3, ArrayView2, Axis, s};
use rayon::prelude::*;

use crate::{
    detector::LandmarkAdapter,
    error::{RecognitionError, Result},
    types::{Frame, FrameKeypoints, SENTINEL, Video},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    /// One adapter walks every processed frame in order.
    Sequential,
    /// The processed frames are split into this many contiguous chunks, each
    /// handled by its own adapter on the rayon pool.
    Chunked(usize),
}

#[derive(Clone, Debug)]
pub struct ExtractorConfig {
    /// Run the detectors on every `stride`-th frame only.
    pub stride: usize,
    /// Fill skipped frames by linear interpolation. When off, the sequence
    /// holds only the processed frames.
    pub interpolate: bool,
    pub parallelism: Parallelism,
    /// Flip frames top-to-bottom before detection.
    pub flip_vertical: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            interpolate: true,
            parallelism: Parallelism::Sequential,
            flip_vertical: false,
        }
    }
}

/// Keypoints of a clip as a `(frames, keypoints, 3)` tensor.
///
/// `x` and `y` are in pixels of a `width` x `height` frame, `z` is the
/// detector depth. Undetected keypoints hold the sentinel in all three
/// coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct KeypointSequence {
    pub keypoints: Array3<f32>,
    pub width: u32,
    pub height: u32,
}

impl KeypointSequence {
    pub fn new(keypoints: Array3<f32>, width: u32, height: u32) -> Self {
        Self {
            keypoints,
            width,
            height,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len_of(Axis(1))
    }

    /// Validity per `(frame, keypoint)`: no coordinate is the sentinel.
    pub fn validity(&self) -> Array2<bool> {
        validity(&self.keypoints)
    }
}

pub(crate) fn validity(keypoints: &Array3<f32>) -> Array2<bool> {
    keypoints.map_axis(Axis(2), |kp| kp.iter().all(|&v| v != SENTINEL))
}

pub fn timestamp_ms(fps: f32, frame_index: usize) -> u64 {
    (1000.0 / fps as f64 * frame_index as f64).round() as u64
}

pub struct KeypointExtractor {
    cfg: ExtractorConfig,
}

impl KeypointExtractor {
    pub fn new(cfg: ExtractorConfig) -> Result<Self> {
        if cfg.stride == 0 {
            return Err(RecognitionError::InvalidConfig(
                "extractor stride must be at least 1".into(),
            ));
        }
        if cfg.parallelism == Parallelism::Chunked(0) {
            return Err(RecognitionError::InvalidConfig(
                "chunked extraction needs at least one worker".into(),
            ));
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.cfg
    }

    /// Extracts with a single, caller-owned adapter. The configured
    /// parallelism is ignored.
    pub fn extract(&self, adapter: &mut LandmarkAdapter, video: &Video) -> Result<KeypointSequence> {
        let (width, height, indices) = self.plan(video)?;
        let started = Instant::now();
        let rows = run_frames(adapter, video, &indices, self.cfg.flip_vertical);
        self.finish(rows, &indices, video.frames.len(), width, height, started)
    }

    /// Extracts with adapters built on demand by `factory`, following the
    /// configured parallelism. Adapters are dropped (and closed) afterwards.
    pub fn extract_with<F>(&self, factory: F, video: &Video) -> Result<KeypointSequence>
    where
        F: Fn() -> Result<LandmarkAdapter> + Sync,
    {
        let (width, height, indices) = self.plan(video)?;
        let started = Instant::now();

        let rows = match self.cfg.parallelism {
            Parallelism::Sequential => {
                let mut adapter = factory()?;
                run_frames(&mut adapter, video, &indices, self.cfg.flip_vertical)
            }
            Parallelism::Chunked(workers) => {
                let chunk = indices.len().div_ceil(workers.max(1)).max(1);
                let parts: Vec<Vec<Option<FrameKeypoints>>> = indices
                    .par_chunks(chunk)
                    .map(|part| {
                        let mut adapter = factory()?;
                        Ok(run_frames(&mut adapter, video, part, self.cfg.flip_vertical))
                    })
                    .collect::<Result<_>>()?;
                parts.into_iter().flatten().collect()
            }
        };

        self.finish(rows, &indices, video.frames.len(), width, height, started)
    }

    fn plan(&self, video: &Video) -> Result<(u32, u32, Vec<usize>)> {
        let (width, height) = video
            .dimensions()
            .ok_or_else(|| RecognitionError::extraction("video has no frames"))?;
        if video
            .frames
            .iter()
            .any(|f| f.width != width || f.height != height)
        {
            return Err(RecognitionError::extraction(
                "video frames do not share one size",
            ));
        }
        if !(video.fps.is_finite() && video.fps > 0.0) {
            return Err(RecognitionError::extraction(format!(
                "invalid frame rate {}",
                video.fps
            )));
        }
        let indices = (0..video.frames.len()).step_by(self.cfg.stride).collect();
        Ok((width, height, indices))
    }

    fn finish(
        &self,
        rows: Vec<Option<FrameKeypoints>>,
        indices: &[usize],
        total_frames: usize,
        width: u32,
        height: u32,
        started: Instant,
    ) -> Result<KeypointSequence> {
        if rows.iter().all(Option::is_none) {
            return Err(RecognitionError::extraction(format!(
                "landmark detection failed on all {} processed frames",
                rows.len()
            )));
        }

        let num_keypoints = rows.iter().flatten().map(FrameKeypoints::len).max().unwrap_or(0);
        let mut processed = Array3::from_elem((rows.len(), num_keypoints, 3), SENTINEL);
        for (mut dst, row) in processed.outer_iter_mut().zip(&rows) {
            if let Some(row) = row {
                for (mut cell, kp) in dst.outer_iter_mut().zip(row.iter()) {
                    if kp.is_present() {
                        cell[0] = kp.x * width as f32;
                        cell[1] = kp.y * height as f32;
                        cell[2] = kp.z;
                    }
                }
            }
        }

        let keypoints = if self.cfg.stride > 1 && self.cfg.interpolate {
            interpolate(&processed, indices, total_frames)
        } else {
            processed
        };

        log::info!(
            "keypoint extraction finished: {:?} from {} processed of {} frames in {:.2?}",
            keypoints.shape(),
            indices.len(),
            total_frames,
            started.elapsed()
        );
        Ok(KeypointSequence::new(keypoints, width, height))
    }
}

/// Runs the adapter on `indices`. A failed frame is logged and comes back
/// as `None`.
fn run_frames(
    adapter: &mut LandmarkAdapter,
    video: &Video,
    indices: &[usize],
    flip_vertical: bool,
) -> Vec<Option<FrameKeypoints>> {
    adapter.begin_clip();
    indices
        .iter()
        .map(|&idx| {
            let ts = timestamp_ms(video.fps, idx);
            let result: AnyResult<FrameKeypoints> = if flip_vertical {
                let mut frame: Frame = video.frames[idx].clone();
                frame.flip_vertical();
                adapter.try_detect(&frame, ts)
            } else {
                adapter.try_detect(&video.frames[idx], ts)
            };
            match result {
                Ok(kp) => Some(kp),
                Err(err) => {
                    log::warn!("frame {idx} ({ts} ms): landmark detection failed: {err:#}");
                    None
                }
            }
        })
        .collect()
}

/// Densifies `processed` (one row per entry of `indices`) to `total` frames.
///
/// Processed frames are copied verbatim. A skipped frame between two
/// processed ones is their linear blend with weight
/// `(idx - prev) / (next - prev)`; a keypoint missing in either neighbor
/// stays missing. Frames before the first or after the last processed index
/// copy that frame.
pub fn interpolate(processed: &Array3<f32>, indices: &[usize], total: usize) -> Array3<f32> {
    let (_, k, c) = processed.dim();
    let mut out = Array3::from_elem((total, k, c), SENTINEL);
    if indices.is_empty() {
        return out;
    }

    let mut next_pos = 0;
    for idx in 0..total {
        while next_pos < indices.len() && indices[next_pos] < idx {
            next_pos += 1;
        }
        let mut dst = out.slice_mut(s![idx, .., ..]);

        if next_pos < indices.len() && indices[next_pos] == idx {
            dst.assign(&processed.slice(s![next_pos, .., ..]));
        } else if next_pos == 0 {
            dst.assign(&processed.slice(s![0, .., ..]));
        } else if next_pos == indices.len() {
            dst.assign(&processed.slice(s![indices.len() - 1, .., ..]));
        } else {
            let (prev, next) = (indices[next_pos - 1], indices[next_pos]);
            let weight = (idx - prev) as f32 / (next - prev) as f32;
            blend(
                processed.slice(s![next_pos - 1, .., ..]),
                processed.slice(s![next_pos, .., ..]),
                weight,
                &mut dst,
            );
        }
    }
    out
}

fn blend(
    a: ArrayView2<'_, f32>,
    b: ArrayView2<'_, f32>,
    weight: f32,
    dst: &mut ndarray::ArrayViewMut2<'_, f32>,
) {
    for ((pa, pb), mut pd) in a.outer_iter().zip(b.outer_iter()).zip(dst.outer_iter_mut()) {
        let present = pa.iter().chain(pb.iter()).all(|&v| v != SENTINEL);
        if !present {
            continue;
        }
        for ((&va, &vb), vd) in pa.iter().zip(pb.iter()).zip(pd.iter_mut()) {
            *vd = (1.0 - weight) * va + weight * vb;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use anyhow::anyhow;
    use ndarray::array;

    use super::*;
    use crate::{
        detector::{
            FaceDetection, FaceLandmarker, HandDetection, HandLandmarker, PoseDetection,
            PoseLandmarker,
        },
        layout::KeypointLayout,
        types::{Handedness, Keypoint},
    };

    /// Hand x follows the timestamp so interpolation is observable.
    struct RampHands {
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl HandLandmarker for RampHands {
        fn detect(&mut self, _frame: &Frame, ts: u64) -> AnyResult<Vec<HandDetection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("broken"));
            }
            let x = ts as f32 / 1000.0;
            Ok(vec![HandDetection {
                landmarks: vec![Keypoint::new(x, 0.5, 0.1); 21],
                handedness: Handedness::Right,
                score: 1.0,
            }])
        }
    }

    struct NoFace;
    impl FaceLandmarker for NoFace {
        fn detect(
            &mut self,
            _: &Frame,
            _: u64,
            _: Option<&PoseDetection>,
        ) -> AnyResult<Vec<FaceDetection>> {
            Ok(Vec::new())
        }
    }

    struct NoPose;
    impl PoseLandmarker for NoPose {
        fn detect(&mut self, _: &Frame, _: u64) -> AnyResult<Option<PoseDetection>> {
            Ok(None)
        }
    }

    fn adapter(fail: bool, calls: Arc<AtomicUsize>) -> LandmarkAdapter {
        LandmarkAdapter::new(
            Box::new(RampHands { fail, calls }),
            Box::new(NoFace),
            Box::new(NoPose),
            KeypointLayout::compact(),
        )
    }

    fn video(frames: usize) -> Video {
        Video {
            frames: (0..frames)
                .map(|_| Frame::new(vec![0; 8 * 4 * 4], 8, 4).unwrap())
                .collect(),
            fps: 10.0,
        }
    }

    #[test]
    fn timestamps_round_to_milliseconds() {
        assert_eq!(timestamp_ms(30.0, 1), 33);
        assert_eq!(timestamp_ms(30.0, 2), 67);
        assert_eq!(timestamp_ms(24.0, 0), 0);
    }

    #[test]
    fn dense_extraction_denormalizes_present_points_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = KeypointExtractor::new(ExtractorConfig::default()).unwrap();
        let seq = extractor
            .extract(&mut adapter(false, calls.clone()), &video(5))
            .unwrap();
        assert_eq!(seq.keypoints.dim(), (5, 63, 3));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 200 ms at 8 px wide
        assert!((seq.keypoints[[2, 0, 0]] - 1.6).abs() < 1e-5);
        assert!((seq.keypoints[[2, 0, 1]] - 2.0).abs() < 1e-5);
        assert_eq!(seq.keypoints[[2, 0, 2]], 0.1);
        assert_eq!(seq.keypoints[[2, 21, 0]], SENTINEL);
        assert_eq!(seq.keypoints[[2, 50, 1]], SENTINEL);
    }

    #[test]
    fn strided_extraction_matches_dense_at_sampled_frames() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dense = KeypointExtractor::new(ExtractorConfig::default())
            .unwrap()
            .extract(&mut adapter(false, calls.clone()), &video(7))
            .unwrap();
        let strided = KeypointExtractor::new(ExtractorConfig {
            stride: 3,
            ..ExtractorConfig::default()
        })
        .unwrap()
        .extract(&mut adapter(false, calls), &video(7))
        .unwrap();

        assert_eq!(strided.len(), 7);
        for idx in [0, 3, 6] {
            assert_eq!(
                strided.keypoints.slice(s![idx, .., ..]),
                dense.keypoints.slice(s![idx, .., ..])
            );
        }
        // frame 4 = 2/3 of frame 3 + 1/3 of frame 6
        let expected = (2.0 * dense.keypoints[[3, 0, 0]] + dense.keypoints[[6, 0, 0]]) / 3.0;
        assert!((strided.keypoints[[4, 0, 0]] - expected).abs() < 1e-4);
    }

    #[test]
    fn interpolation_copies_edges_and_keeps_missing() {
        let processed = array![[[2.0, 2.0, 0.0], [SENTINEL, SENTINEL, SENTINEL]], [
            [4.0, 6.0, 1.0],
            [1.0, 1.0, 1.0]
        ]];
        let out = interpolate(&processed, &[1, 3], 5);
        assert_eq!(out.slice(s![0, .., ..]), processed.slice(s![0, .., ..]));
        assert_eq!(out.slice(s![4, .., ..]), processed.slice(s![1, .., ..]));
        assert_eq!(out[[2, 0, 0]], 3.0);
        assert_eq!(out[[2, 0, 1]], 4.0);
        assert_eq!(out[[2, 0, 2]], 0.5);
        assert_eq!(out[[2, 1, 0]], SENTINEL);
    }

    #[test]
    fn without_interpolation_only_processed_frames_remain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seq = KeypointExtractor::new(ExtractorConfig {
            stride: 2,
            interpolate: false,
            ..ExtractorConfig::default()
        })
        .unwrap()
        .extract(&mut adapter(false, calls), &video(5))
        .unwrap();
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn chunked_extraction_matches_sequential() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = || -> Result<LandmarkAdapter> { Ok(adapter(false, calls.clone())) };
        let sequential = KeypointExtractor::new(ExtractorConfig::default())
            .unwrap()
            .extract_with(factory, &video(9))
            .unwrap();
        let chunked = KeypointExtractor::new(ExtractorConfig {
            parallelism: Parallelism::Chunked(3),
            ..ExtractorConfig::default()
        })
        .unwrap()
        .extract_with(factory, &video(9))
        .unwrap();
        assert_eq!(sequential, chunked);
    }

    #[test]
    fn total_failure_is_an_extraction_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = KeypointExtractor::new(ExtractorConfig::default()).unwrap();
        let err = extractor
            .extract(&mut adapter(true, calls.clone()), &video(3))
            .unwrap_err();
        assert!(matches!(err, RecognitionError::ExtractionFailed(_)));

        let err = extractor
            .extract(&mut adapter(false, calls), &video(0))
            .unwrap_err();
        assert!(matches!(err, RecognitionError::ExtractionFailed(_)));
    }

    #[test]
    fn mixed_frame_sizes_are_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut clip = video(2);
        clip.frames.push(Frame::new(vec![0; 4 * 4 * 4], 4, 4).unwrap());
        let err = KeypointExtractor::new(ExtractorConfig::default())
            .unwrap()
            .extract(&mut adapter(false, calls), &clip)
            .unwrap_err();
        assert!(matches!(err, RecognitionError::ExtractionFailed(_)));
    }

    #[test]
    fn zero_stride_is_invalid() {
        let err = KeypointExtractor::new(ExtractorConfig {
            stride: 0,
            ..ExtractorConfig::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, RecognitionError::InvalidConfig(_)));
    }
}
