//! Offline conversion of a clip collection into keypoint files.
//!
//! Each worker thread owns a private set of detectors and pulls clip paths
//! from a shared queue, so detectors are never shared between threads.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    thread,
    time::Instant,
};

use anyhow::{Context, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use candle_core::{DType, Device, Tensor};
use ndarray::Array3;
use safetensors::{Dtype, SafeTensors};

use crate::{
    detector::LandmarkAdapter,
    error::{RecognitionError, Result},
    extractor::{ExtractorConfig, KeypointExtractor, KeypointSequence},
    video::{VideoDecoder, decode_video},
};

const KEYPOINTS_TENSOR: &str = "keypoints";
const OUTPUT_EXTENSION: &str = "safetensors";

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub workers: usize,
    pub output_dir: PathBuf,
    pub extractor: ExtractorConfig,
    /// Re-extract clips whose output file already exists.
    pub overwrite: bool,
    pub progress: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            output_dir: PathBuf::from("keypoints"),
            extractor: ExtractorConfig::default(),
            overwrite: false,
            progress: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub converted: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.converted.len() + self.skipped.len() + self.failed.len()
    }
}

enum Outcome {
    Converted(PathBuf),
    Skipped(PathBuf),
    Failed(PathBuf, String),
}

/// Clips under `dir` that `decoder` can read, sorted by path.
pub fn collect_inputs(dir: &Path, decoder: &dyn VideoDecoder) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|err| {
        RecognitionError::InvalidConfig(format!("cannot read input directory {}: {err}", dir.display()))
    })?;
    let mut inputs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| decoder.accepts(path))
        .collect();
    inputs.sort();
    Ok(inputs)
}

pub fn output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip".to_string());
    output_dir.join(format!("{stem}.{OUTPUT_EXTENSION}"))
}

/// Writes a sequence as a single f32 tensor with the frame size in the
/// file metadata.
pub fn save_keypoints(sequence: &KeypointSequence, path: &Path) -> anyhow::Result<()> {
    let tensor = Tensor::from_iter(sequence.keypoints.iter().copied(), &Device::Cpu)?
        .reshape(sequence.keypoints.dim())?;
    let metadata: HashMap<String, String> = [
        ("width".to_string(), sequence.width.to_string()),
        ("height".to_string(), sequence.height.to_string()),
    ]
    .into_iter()
    .collect();
    safetensors::serialize_to_file([(KEYPOINTS_TENSOR, &tensor)], &Some(metadata), path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn load_keypoints(path: &Path) -> Result<KeypointSequence> {
    read_keypoints(path).map_err(|err| RecognitionError::extraction(format!("{err:#}")))
}

fn read_keypoints(path: &Path) -> anyhow::Result<KeypointSequence> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (_, header) = SafeTensors::read_metadata(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let dimension = |key: &str| -> anyhow::Result<u32> {
        header
            .metadata()
            .as_ref()
            .and_then(|m| m.get(key))
            .ok_or_else(|| anyhow!("{} has no {key} metadata", path.display()))?
            .parse()
            .with_context(|| format!("bad {key} in {}", path.display()))
    };
    let (width, height) = (dimension("width")?, dimension("height")?);

    let tensors = SafeTensors::deserialize(&data)?;
    let view = tensors.tensor(KEYPOINTS_TENSOR)?;
    let &[frames, points, coords] = view.shape() else {
        return Err(anyhow!("keypoints tensor must be 3-D, got {:?}", view.shape()));
    };
    if view.dtype() != Dtype::F32 || coords != 3 {
        return Err(anyhow!(
            "expected f32 keypoints of shape (T, K, 3), got {:?} {:?}",
            view.dtype(),
            view.shape()
        ));
    }
    let values = Tensor::from_raw_buffer(view.data(), DType::F32, view.shape(), &Device::Cpu)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let keypoints = Array3::from_shape_vec((frames, points, 3), values)?;
    Ok(KeypointSequence::new(keypoints, width, height))
}

fn create_progress_bar(total: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} clips ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

fn convert_one(
    input: &Path,
    cfg: &BatchConfig,
    extractor: &KeypointExtractor,
    decoder: &dyn VideoDecoder,
    detectors: &mut LandmarkAdapter,
) -> Outcome {
    let output = output_path(&cfg.output_dir, input);
    if !cfg.overwrite && output.exists() {
        return Outcome::Skipped(input.to_path_buf());
    }
    let result = decode_video(decoder, input)
        .and_then(|video| extractor.extract(detectors, &video))
        .and_then(|sequence| {
            save_keypoints(&sequence, &output).map_err(|err| RecognitionError::extraction(format!("{err:#}")))
        });
    match result {
        Ok(()) => Outcome::Converted(input.to_path_buf()),
        Err(err) => Outcome::Failed(input.to_path_buf(), err.to_string()),
    }
}

/// Converts every clip in `inputs`, building one detector set per worker
/// with `factory`. Per-clip failures are collected in the report; a
/// detector that cannot be created aborts the run.
pub fn run_batch<F>(
    inputs: &[PathBuf],
    cfg: &BatchConfig,
    decoder: &dyn VideoDecoder,
    factory: F,
) -> Result<BatchReport>
where
    F: Fn() -> Result<LandmarkAdapter> + Sync,
{
    if cfg.workers == 0 {
        return Err(RecognitionError::InvalidConfig(
            "batch conversion needs at least one worker".into(),
        ));
    }
    let extractor = KeypointExtractor::new(cfg.extractor.clone())?;
    fs::create_dir_all(&cfg.output_dir).map_err(|err| {
        RecognitionError::InvalidConfig(format!(
            "cannot create output directory {}: {err}",
            cfg.output_dir.display()
        ))
    })?;

    let (queue_tx, queue_rx) = crossbeam_channel::unbounded::<PathBuf>();
    for input in inputs {
        let _ = queue_tx.send(input.clone());
    }
    drop(queue_tx);

    let workers = cfg.workers.min(inputs.len().max(1));
    let started = Instant::now();
    let progress = create_progress_bar(inputs.len(), cfg.progress);
    let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<Outcome>();
    let mut report = BatchReport::default();

    let worker_results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let queue = queue_rx.clone();
                let outcomes = outcome_tx.clone();
                let (factory, extractor) = (&factory, &extractor);
                scope.spawn(move || -> Result<()> {
                    let mut detectors = factory()?;
                    log::debug!("batch worker {id} ready");
                    while let Ok(input) = queue.recv() {
                        let outcome = convert_one(&input, cfg, extractor, decoder, &mut detectors);
                        if outcomes.send(outcome).is_err() {
                            break;
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        drop(outcome_tx);

        for outcome in outcome_rx.iter() {
            match outcome {
                Outcome::Converted(path) => report.converted.push(path),
                Outcome::Skipped(path) => report.skipped.push(path),
                Outcome::Failed(path, reason) => {
                    log::warn!("failed to convert {}: {reason}", path.display());
                    progress.set_message(format!("{} failed", report.failed.len() + 1));
                    report.failed.push((path, reason));
                }
            }
            progress.inc(1);
        }

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(RecognitionError::extraction("batch worker panicked")))
            })
            .collect()
    });
    progress.finish_and_clear();

    for result in worker_results {
        result?;
    }

    report.converted.sort();
    report.skipped.sort();
    report.failed.sort();
    log::info!(
        "converted {} clips ({} skipped, {} failed) in {:.1?}",
        report.converted.len(),
        report.skipped.len(),
        report.failed.len(),
        started.elapsed()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tempfile::tempdir;

    use super::*;
    use crate::{
        detector::{
            HandDetection,
            tests::{FakeFace, FakeHands, FakePose, VideoModeFace},
        },
        layout::KeypointLayout,
        types::{Frame, Handedness, Keypoint, SENTINEL, Video},
    };

    /// Reads "clips" named `<frames>_<anything>.clip`; `0_*` fails.
    struct CountingDecoder;

    impl VideoDecoder for CountingDecoder {
        fn decode(&self, path: &Path) -> anyhow::Result<Video> {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let frames: usize = name
                .split('_')
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| anyhow!("bad clip name {name}"))?;
            if frames == 0 {
                return Err(anyhow!("corrupt clip"));
            }
            let frames = (0..frames)
                .map(|_| Frame::new(vec![0; 10 * 10 * 4], 10, 10))
                .collect::<anyhow::Result<_>>()?;
            Ok(Video { frames, fps: 30.0 })
        }

        fn accepts(&self, path: &Path) -> bool {
            path.extension().is_some_and(|ext| ext == "clip")
        }
    }

    fn factory(built: &AtomicUsize) -> Result<LandmarkAdapter> {
        built.fetch_add(1, Ordering::SeqCst);
        Ok(LandmarkAdapter::new(
            Box::new(FakeHands {
                hands: vec![HandDetection {
                    landmarks: vec![Keypoint::new(0.5, 0.5, 0.0); 21],
                    handedness: Handedness::Left,
                    score: 0.8,
                }],
                fail_at: Vec::new(),
                closes: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(FakeFace(Vec::new())),
            Box::new(FakePose(None)),
            KeypointLayout::compact(),
        ))
    }

    fn config(output_dir: &Path, workers: usize) -> BatchConfig {
        BatchConfig {
            workers,
            output_dir: output_dir.to_path_buf(),
            progress: false,
            ..BatchConfig::default()
        }
    }

    #[test]
    fn converts_clips_and_reports_failures() {
        let input_dir = tempdir().unwrap();
        for name in ["3_a.clip", "5_b.clip", "0_c.clip", "notes.txt"] {
            fs::write(input_dir.path().join(name), b"").unwrap();
        }
        let out = tempdir().unwrap();
        let inputs = collect_inputs(input_dir.path(), &CountingDecoder).unwrap();
        assert_eq!(inputs.len(), 3);

        let built = AtomicUsize::new(0);
        let report = run_batch(&inputs, &config(out.path(), 2), &CountingDecoder, || factory(&built))
            .unwrap();
        assert_eq!(report.converted.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("0_c.clip"));
        assert_eq!(built.load(Ordering::SeqCst), 2);

        let seq = load_keypoints(&out.path().join("5_b.safetensors")).unwrap();
        assert_eq!(seq.keypoints.dim(), (5, 63, 3));
        assert_eq!((seq.width, seq.height), (10, 10));
        assert_eq!(seq.keypoints[[0, 21, 0]], 5.0);
        assert_eq!(seq.keypoints[[0, 0, 0]], SENTINEL);
    }

    #[test]
    fn one_worker_restarts_timestamps_for_every_clip() {
        let input_dir = tempdir().unwrap();
        for name in ["12_a.clip", "5_b.clip"] {
            fs::write(input_dir.path().join(name), b"").unwrap();
        }
        let out = tempdir().unwrap();
        let inputs = collect_inputs(input_dir.path(), &CountingDecoder).unwrap();
        let built = AtomicUsize::new(0);
        let report = run_batch(&inputs, &config(out.path(), 1), &CountingDecoder, || {
            built.fetch_add(1, Ordering::SeqCst);
            Ok(LandmarkAdapter::new(
                Box::new(FakeHands {
                    hands: Vec::new(),
                    fail_at: Vec::new(),
                    closes: Arc::new(AtomicUsize::new(0)),
                }),
                Box::new(VideoModeFace::new()),
                Box::new(FakePose(None)),
                KeypointLayout::compact(),
            ))
        })
        .unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(report.converted.len(), 2);
        assert!(report.failed.is_empty());

        let face = KeypointLayout::compact().face_range();
        for (name, frames) in [("12_a", 12), ("5_b", 5)] {
            let seq = load_keypoints(&out.path().join(format!("{name}.safetensors"))).unwrap();
            assert_eq!(seq.len(), frames);
            assert!((0..frames).all(|t| seq.keypoints[[t, face.start, 0]] != SENTINEL));
        }
    }

    #[test]
    fn existing_outputs_are_skipped_unless_overwriting() {
        let input_dir = tempdir().unwrap();
        fs::write(input_dir.path().join("2_a.clip"), b"").unwrap();
        let out = tempdir().unwrap();
        let inputs = collect_inputs(input_dir.path(), &CountingDecoder).unwrap();
        let built = AtomicUsize::new(0);

        let first = run_batch(&inputs, &config(out.path(), 1), &CountingDecoder, || factory(&built));
        assert_eq!(first.unwrap().converted.len(), 1);
        let second = run_batch(&inputs, &config(out.path(), 1), &CountingDecoder, || factory(&built));
        assert_eq!(second.unwrap().skipped.len(), 1);

        let cfg = BatchConfig {
            overwrite: true,
            ..config(out.path(), 1)
        };
        let third = run_batch(&inputs, &cfg, &CountingDecoder, || factory(&built)).unwrap();
        assert_eq!(third.converted.len(), 1);
        assert_eq!(third.total(), 1);
    }

    #[test]
    fn detector_failure_aborts_the_run() {
        let out = tempdir().unwrap();
        let inputs = vec![PathBuf::from("1_a.clip")];
        let err = run_batch(&inputs, &config(out.path(), 1), &CountingDecoder, || {
            Err(RecognitionError::DetectorInit("missing model".into()))
        })
        .unwrap_err();
        assert!(matches!(err, RecognitionError::DetectorInit(_)));
    }

    #[test]
    fn saved_keypoints_keep_sentinels_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.safetensors");
        let mut kp = Array3::from_elem((2, 4, 3), SENTINEL);
        kp[[1, 2, 0]] = 12.5;
        save_keypoints(&KeypointSequence::new(kp.clone(), 640, 480), &path).unwrap();
        let loaded = load_keypoints(&path).unwrap();
        assert_eq!(loaded.keypoints, kp);
        assert_eq!((loaded.width, loaded.height), (640, 480));
        assert!(load_keypoints(&dir.path().join("missing.safetensors")).is_err());
    }

    #[test]
    fn output_names_follow_input_stems() {
        assert_eq!(
            output_path(Path::new("out"), Path::new("data/clip_01.mp4")),
            PathBuf::from("out/clip_01.safetensors")
        );
    }
}
