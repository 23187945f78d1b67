//! Test-time-augmented recognition: several sampled views of one clip are
//! classified and their logits summed before picking a label.

use ndarray::{Array1, Array3, Array4, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use serde::Serialize;

use crate::{
    error::{RecognitionError, Result},
    extractor::KeypointSequence,
    gloss::GlossTable,
    layout::{KeypointLayout, SelectedKeypoints},
    model::Classifier,
    sampler::{Sample, SampleOptions, process_keypoints},
};

#[derive(Clone, Debug)]
pub struct RecognizerConfig {
    /// Number of sampled views per clip.
    pub samples: usize,
    pub target_length: usize,
    /// Augment every view. When off all views are identical.
    pub augment: bool,
    /// Include left/right mirroring among the augmentations.
    pub mirror: bool,
    /// Output head; the classifier's first head when unset.
    pub head: Option<String>,
    /// Fixed seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            samples: 16,
            target_length: 64,
            augment: true,
            mirror: false,
            head: None,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recognition {
    pub class_index: usize,
    pub label: String,
    /// Summed logit of the winning class.
    pub score: f32,
    pub samples_used: usize,
}

/// Result of one view in the ensemble.
#[derive(Debug)]
pub enum SampleOutcome {
    /// The view had no keypoints and was not classified.
    Empty,
    Failed(RecognitionError),
    Logits(Array1<f32>),
}

/// Summed logits of the views that produced any.
#[derive(Clone, Debug, PartialEq)]
pub struct Ensemble {
    pub logits: Array1<f32>,
    pub used: usize,
}

impl Ensemble {
    /// Index and value of the largest summed logit; ties go to the lowest
    /// index.
    pub fn argmax(&self) -> Option<(usize, f32)> {
        self.logits
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })
    }
}

/// Sums the logits of successful views, skipping empty and failed ones.
///
/// Fails with `InsufficientKeypoints` when every view was empty, and with
/// the last inference error when no view succeeded otherwise.
pub fn combine<I>(outcomes: I) -> Result<Ensemble>
where
    I: IntoIterator<Item = SampleOutcome>,
{
    let mut sum: Option<Array1<f32>> = None;
    let mut used = 0;
    let mut empty = 0;
    let mut last_error = None;

    for (i, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            SampleOutcome::Empty => {
                log::debug!("sample {i} is empty, skipping");
                empty += 1;
            }
            SampleOutcome::Failed(err) => {
                log::warn!("sample {i} failed: {err}");
                last_error = Some(err);
            }
            SampleOutcome::Logits(logits) => {
                match sum.as_mut() {
                    Some(acc) if acc.len() == logits.len() => *acc += &logits,
                    Some(acc) => {
                        last_error = Some(RecognitionError::inference(format!(
                            "sample {i} has {} logits, expected {}",
                            logits.len(),
                            acc.len()
                        )));
                        continue;
                    }
                    None => sum = Some(logits),
                }
                used += 1;
            }
        }
    }

    match (sum, last_error) {
        (Some(logits), _) => Ok(Ensemble { logits, used }),
        (None, Some(err)) => Err(err),
        (None, None) => Err(RecognitionError::InsufficientKeypoints(format!(
            "all {empty} samples were empty"
        ))),
    }
}

pub struct Recognizer {
    classifier: Classifier,
    glosses: GlossTable,
    layout: KeypointLayout,
    selection: SelectedKeypoints,
    head: String,
    cfg: RecognizerConfig,
}

impl Recognizer {
    pub fn new(
        classifier: Classifier,
        glosses: GlossTable,
        layout: KeypointLayout,
        selection: SelectedKeypoints,
        cfg: RecognizerConfig,
    ) -> Result<Self> {
        if cfg.samples == 0 {
            return Err(RecognitionError::InvalidConfig(
                "at least one sample per clip is required".into(),
            ));
        }
        let model_cfg = classifier.config();
        if selection.len() != model_cfg.n_keypoints {
            return Err(RecognitionError::InvalidConfig(format!(
                "{} keypoints selected, classifier expects {}",
                selection.len(),
                model_cfg.n_keypoints
            )));
        }
        if cfg.target_length == 0 || cfg.target_length > model_cfg.max_len {
            return Err(RecognitionError::InvalidConfig(format!(
                "target length {} outside 1..={}",
                cfg.target_length, model_cfg.max_len
            )));
        }
        let head = cfg
            .head
            .clone()
            .unwrap_or_else(|| classifier.default_head().to_string());
        if classifier.head(&head).is_none() {
            return Err(RecognitionError::InvalidConfig(format!(
                "classifier has no head named {head:?}"
            )));
        }

        let selection = if cfg.mirror && selection.flipped().is_none() {
            selection
                .with_mirror(&layout)
                .map_err(|err| RecognitionError::InvalidConfig(format!("{err:#}")))?
        } else {
            selection
        };

        Ok(Self {
            classifier,
            glosses,
            layout,
            selection,
            head,
            cfg,
        })
    }

    pub fn layout(&self) -> &KeypointLayout {
        &self.layout
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.cfg
    }

    fn sample_options(&self) -> SampleOptions {
        SampleOptions {
            target_length: self.cfg.target_length,
            augment: self.cfg.augment,
            mirror: self.cfg.mirror,
        }
    }

    /// Draws the configured number of views, in order, from one RNG.
    pub fn draw_samples<R: Rng + ?Sized>(
        &self,
        seq: &KeypointSequence,
        rng: &mut R,
    ) -> Result<Vec<Sample>> {
        let opts = self.sample_options();
        (0..self.cfg.samples)
            .map(|_| process_keypoints(seq, &self.selection, &self.layout, &opts, rng))
            .collect()
    }

    pub fn recognize(&self, seq: &KeypointSequence) -> Result<Recognition> {
        let mut rng = match self.cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.recognize_with_rng(seq, &mut rng)
    }

    pub fn recognize_with_rng<R: Rng + ?Sized>(
        &self,
        seq: &KeypointSequence,
        rng: &mut R,
    ) -> Result<Recognition> {
        let samples = self.draw_samples(seq, rng)?;
        let outcomes: Vec<SampleOutcome> = samples
            .par_iter()
            .map(|sample| self.classify_sample(sample))
            .collect();

        let ensemble = combine(outcomes)?;
        let (class_index, score) = ensemble
            .argmax()
            .ok_or_else(|| RecognitionError::inference("classifier produced no logits"))?;
        let label = self.glosses.label(class_index).to_string();

        log::info!(
            "recognized {label:?} (class {class_index}, score {score:.3}) from {}/{} samples",
            ensemble.used,
            self.cfg.samples
        );
        Ok(Recognition {
            class_index,
            label,
            score,
            samples_used: ensemble.used,
        })
    }

    fn classify_sample(&self, sample: &Sample) -> SampleOutcome {
        if sample.is_empty() {
            return SampleOutcome::Empty;
        }
        let keypoints: Array4<f32> = sample.keypoints.clone().insert_axis(Axis(0));
        let valid: Array3<bool> = sample.valid.clone().insert_axis(Axis(0));
        match self.classifier.classify(&self.head, &keypoints, &valid) {
            Ok(logits) => SampleOutcome::Logits(logits.index_axis_move(Axis(0), 0)),
            Err(err) => SampleOutcome::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array3, array};

    use super::*;
    use crate::{model::tiny_config, types::SENTINEL};

    fn recognizer(cfg: RecognizerConfig) -> Recognizer {
        let layout = KeypointLayout::compact();
        let selection = SelectedKeypoints::curated(&layout).unwrap();
        let classifier = Classifier::new_random(tiny_config(63, 16), 42).unwrap();
        let glosses = GlossTable::from_pairs((0..5).map(|i| (i, format!("word{i}")))).unwrap();
        Recognizer::new(classifier, glosses, layout, selection, cfg).unwrap()
    }

    fn clip(frames: usize) -> KeypointSequence {
        let kp = Array3::from_shape_fn((frames, 63, 3), |(t, k, c)| match c {
            0 => 10.0 + k as f32,
            1 => 20.0 + t as f32,
            _ => 0.0,
        });
        KeypointSequence::new(kp, 128, 96)
    }

    fn small_cfg() -> RecognizerConfig {
        RecognizerConfig {
            samples: 4,
            target_length: 16,
            seed: Some(3),
            ..RecognizerConfig::default()
        }
    }

    #[test]
    fn combine_sums_and_skips() {
        let ensemble = combine([
            SampleOutcome::Logits(array![1.0, 0.0, 2.0]),
            SampleOutcome::Empty,
            SampleOutcome::Failed(RecognitionError::inference("nan")),
            SampleOutcome::Logits(array![0.0, 3.0, 0.5]),
        ])
        .unwrap();
        assert_eq!(ensemble.used, 2);
        assert_eq!(ensemble.logits, array![1.0, 3.0, 2.5]);
        assert_eq!(ensemble.argmax(), Some((1, 3.0)));
    }

    #[test]
    fn combine_all_empty_is_insufficient() {
        let err = combine([SampleOutcome::Empty, SampleOutcome::Empty]).unwrap_err();
        assert!(matches!(err, RecognitionError::InsufficientKeypoints(_)));
    }

    #[test]
    fn combine_without_successes_reports_failure() {
        let err = combine([
            SampleOutcome::Empty,
            SampleOutcome::Failed(RecognitionError::inference("shape")),
        ])
        .unwrap_err();
        assert!(matches!(err, RecognitionError::ModelInference(_)));
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        let ensemble = Ensemble {
            logits: array![2.0, 5.0, 5.0],
            used: 1,
        };
        assert_eq!(ensemble.argmax(), Some((1, 5.0)));
    }

    #[test]
    fn recognizes_with_all_samples() {
        let rec = recognizer(small_cfg());
        let result = rec.recognize(&clip(30)).unwrap();
        assert_eq!(result.samples_used, 4);
        assert!(result.class_index < 7);
        if result.class_index < 5 {
            assert_eq!(result.label, format!("word{}", result.class_index));
        } else {
            assert_eq!(result.label, "UNKNOWN");
        }
    }

    #[test]
    fn seeded_recognition_is_reproducible() {
        let rec = recognizer(small_cfg());
        assert_eq!(rec.recognize(&clip(20)).unwrap(), rec.recognize(&clip(20)).unwrap());
    }

    #[test]
    fn empty_clip_is_insufficient() {
        let rec = recognizer(small_cfg());
        let err = rec
            .recognize(&KeypointSequence::new(Array3::zeros((0, 63, 3)), 128, 96))
            .unwrap_err();
        assert!(matches!(err, RecognitionError::InsufficientKeypoints(_)));
    }

    #[test]
    fn undetected_clip_still_gets_a_label() {
        let rec = recognizer(small_cfg());
        let seq = KeypointSequence::new(Array3::from_elem((16, 63, 3), SENTINEL), 128, 96);
        let result = rec.recognize(&seq).unwrap();
        assert_eq!(result.samples_used, 4);
    }

    #[test]
    fn unaugmented_samples_are_identical() {
        let rec = recognizer(RecognizerConfig {
            augment: false,
            ..small_cfg()
        });
        let samples = rec.draw_samples(&clip(40), &mut StdRng::seed_from_u64(0)).unwrap();
        assert!(samples.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let layout = KeypointLayout::compact();
        let selection = SelectedKeypoints::curated(&layout).unwrap();
        let classifier = Classifier::new_random(tiny_config(63, 16), 0).unwrap();
        let build = |cfg: RecognizerConfig| {
            Recognizer::new(
                classifier.clone(),
                GlossTable::default(),
                layout.clone(),
                selection.clone(),
                cfg,
            )
        };
        assert!(build(RecognizerConfig { samples: 0, ..small_cfg() }).is_err());
        assert!(build(RecognizerConfig { target_length: 17, ..small_cfg() }).is_err());
        assert!(
            build(RecognizerConfig {
                head: Some("missing".into()),
                ..small_cfg()
            })
            .is_err()
        );
        assert_eq!(
            build(RecognizerConfig {
                head: Some("autsl".into()),
                ..small_cfg()
            })
            .unwrap()
            .head(),
            "autsl"
        );
    }

    #[test]
    fn mirroring_an_unpaired_face_selection_is_a_config_error() {
        let layout = KeypointLayout::full();
        let selection = SelectedKeypoints::new((42..42 + 63).collect(), None).unwrap();
        let rejected = Recognizer::new(
            Classifier::new_random(tiny_config(63, 16), 0).unwrap(),
            GlossTable::default(),
            layout.clone(),
            selection,
            RecognizerConfig {
                mirror: true,
                ..small_cfg()
            },
        );
        assert!(matches!(rejected, Err(RecognitionError::InvalidConfig(_))));

        let curated = Recognizer::new(
            Classifier::new_random(tiny_config(63, 16), 0).unwrap(),
            GlossTable::default(),
            layout.clone(),
            SelectedKeypoints::curated(&layout).unwrap(),
            RecognizerConfig {
                mirror: true,
                ..small_cfg()
            },
        );
        assert!(curated.is_ok());
    }
}
