use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sign_recognizer::{
    batch::{self, BatchConfig},
    detector::{DetectorConfig, LandmarkAdapter},
    extractor::{ExtractorConfig, KeypointExtractor, Parallelism},
    gloss::GlossTable,
    layout::{KeypointLayout, SelectedKeypoints},
    model::{Classifier, ClassifierConfig},
    recognizer::{Recognizer, RecognizerConfig},
    service::RecognitionService,
    video::{ImageSequenceDecoder, decode_video},
};

/// Recognize isolated sign-language words in video clips
#[derive(Parser)]
#[command(name = "sign-recognizer", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recognize the word signed in one clip
    Recognize(RecognizeArgs),
    /// Extract the keypoint sequence of one clip
    Extract(ExtractArgs),
    /// Convert every clip in a directory into keypoint files
    Batch(BatchArgs),
}

#[derive(Args)]
struct DetectorArgs {
    /// Directory holding the landmark detector models
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,
    /// Fail instead of downloading missing models
    #[arg(long)]
    offline: bool,
    /// Store every face mesh and pose landmark instead of the curated subset
    #[arg(long)]
    full_layout: bool,
    /// Frame rate of image-sequence clips
    #[arg(long, default_value_t = 30.0)]
    fps: f32,
    /// Process every n-th frame and interpolate the rest
    #[arg(long, default_value_t = 1)]
    stride: usize,
    /// Hold frames not processed because of the stride at the sentinel
    #[arg(long)]
    no_interpolate: bool,
    /// Flip frames upside down before detection
    #[arg(long)]
    flip_vertical: bool,
}

impl DetectorArgs {
    fn layout(&self) -> KeypointLayout {
        if self.full_layout {
            KeypointLayout::full()
        } else {
            KeypointLayout::compact()
        }
    }

    fn detector_config(&self) -> DetectorConfig {
        let defaults = DetectorConfig::default();
        let relocate = |path: PathBuf| {
            path.file_name()
                .map(|name| self.models_dir.join(name))
                .unwrap_or(path)
        };
        DetectorConfig {
            palm_model: relocate(defaults.palm_model.clone()),
            handpose_model: relocate(defaults.handpose_model.clone()),
            face_model: relocate(defaults.face_model.clone()),
            pose_model: relocate(defaults.pose_model.clone()),
            download_missing: !self.offline,
            ..defaults
        }
    }

    fn extractor_config(&self, parallelism: Parallelism) -> ExtractorConfig {
        ExtractorConfig {
            stride: self.stride,
            interpolate: !self.no_interpolate,
            parallelism,
            flip_vertical: self.flip_vertical,
        }
    }

    fn adapter(&self) -> sign_recognizer::Result<LandmarkAdapter> {
        LandmarkAdapter::from_config(&self.detector_config(), self.layout())
    }
}

#[derive(Args)]
struct RecognizeArgs {
    /// Directory of frames making up the clip
    clip: PathBuf,
    /// Classifier weights (safetensors); random weights when omitted
    #[arg(long)]
    weights: Option<PathBuf>,
    /// CSV file with `idx,word` columns
    #[arg(long)]
    glosses: Option<PathBuf>,
    /// Output head to score with
    #[arg(long)]
    head: Option<String>,
    /// Number of sampled views to ensemble
    #[arg(long, default_value_t = 16)]
    samples: usize,
    /// Disable test-time augmentation
    #[arg(long)]
    no_augment: bool,
    /// Include left/right mirroring in the augmentation
    #[arg(long)]
    mirror: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[command(flatten)]
    detector: DetectorArgs,
}

#[derive(Args)]
struct ExtractArgs {
    /// Directory of frames making up the clip
    clip: PathBuf,
    /// Output keypoint file
    #[arg(short, long)]
    output: PathBuf,
    /// Extract with this many detector sets in parallel
    #[arg(long, default_value_t = 1)]
    jobs: usize,
    #[command(flatten)]
    detector: DetectorArgs,
}

#[derive(Args)]
struct BatchArgs {
    /// Directory whose sub-directories are clips
    input_dir: PathBuf,
    #[arg(short, long, default_value = "keypoints")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Re-extract clips that already have an output file
    #[arg(long)]
    overwrite: bool,
    #[command(flatten)]
    detector: DetectorArgs,
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Recognize(args) => recognize(args),
        Command::Extract(args) => extract(args),
        Command::Batch(args) => run_batch(args),
    }
}

fn recognize(args: RecognizeArgs) -> Result<()> {
    let layout = args.detector.layout();
    let seed = args.seed.unwrap_or(0);
    let classifier = match &args.weights {
        Some(path) => {
            let (classifier, report) =
                Classifier::from_safetensors(ClassifierConfig::default(), seed, path)?;
            if !report.is_complete() {
                log::warn!(
                    "{} parameters missing and {} mismatched in {}",
                    report.missing.len(),
                    report.mismatched.len(),
                    path.display()
                );
            }
            classifier
        }
        None => {
            log::warn!("no weights given, classifying with random parameters");
            Classifier::new_random(ClassifierConfig::default(), seed)?
        }
    };
    let glosses = match &args.glosses {
        Some(path) => GlossTable::load(path)?,
        None => GlossTable::default(),
    };

    let recognizer = Recognizer::new(
        classifier,
        glosses,
        layout.clone(),
        SelectedKeypoints::curated(&layout)?,
        RecognizerConfig {
            samples: args.samples,
            augment: !args.no_augment,
            mirror: args.mirror,
            head: args.head.clone(),
            seed: args.seed,
            ..RecognizerConfig::default()
        },
    )?;
    let extractor = KeypointExtractor::new(args.detector.extractor_config(Parallelism::Sequential))?;
    let service = RecognitionService::start(args.detector.adapter()?, extractor, recognizer)?;

    let decoder = ImageSequenceDecoder::new(args.detector.fps);
    let video = decode_video(&decoder, &args.clip)?;
    let result = service.recognize(video);
    service.shutdown();

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

fn extract(args: ExtractArgs) -> Result<()> {
    let parallelism = match args.jobs {
        0 | 1 => Parallelism::Sequential,
        n => Parallelism::Chunked(n),
    };
    let extractor = KeypointExtractor::new(args.detector.extractor_config(parallelism))?;
    let decoder = ImageSequenceDecoder::new(args.detector.fps);
    let video = decode_video(&decoder, &args.clip)?;

    let sequence = extractor.extract_with(|| args.detector.adapter(), &video)?;
    batch::save_keypoints(&sequence, &args.output)?;
    println!(
        "{}",
        serde_json::json!({
            "output": args.output.display().to_string(),
            "frames": sequence.len(),
            "keypoints": sequence.num_keypoints(),
            "width": sequence.width,
            "height": sequence.height,
        })
    );
    Ok(())
}

fn run_batch(args: BatchArgs) -> Result<()> {
    let decoder = ImageSequenceDecoder::new(args.detector.fps);
    let inputs = batch::collect_inputs(&args.input_dir, &decoder)?;
    let cfg = BatchConfig {
        workers: args.workers,
        output_dir: args.output_dir.clone(),
        extractor: args.detector.extractor_config(Parallelism::Sequential),
        overwrite: args.overwrite,
        progress: true,
    };

    let report = batch::run_batch(&inputs, &cfg, &decoder, || args.detector.adapter())
        .with_context(|| format!("batch conversion of {} failed", args.input_dir.display()))?;
    println!(
        "{}",
        serde_json::json!({
            "converted": report.converted.len(),
            "skipped": report.skipped.len(),
            "failed": report
                .failed
                .iter()
                .map(|(path, reason)| serde_json::json!({
                    "clip": path.display().to_string(),
                    "error": reason,
                }))
                .collect::<Vec<_>>(),
        })
    );
    Ok(())
}
