//! Sign-language word recognition from video.
//!
//! Frames go through landmark detection ([`detector`]), are folded into a
//! dense keypoint sequence ([`extractor`]), resampled and augmented to a
//! fixed length ([`sampler`]) and classified by a transformer
//! ([`model`]). [`recognizer`] ensembles several sampled views per clip and
//! [`service`] hosts the whole pipeline behind a background worker.

pub mod batch;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod gloss;
pub mod layout;
pub mod model;
pub mod model_download;
pub mod recognizer;
pub mod sampler;
pub mod service;
pub mod types;
pub mod video;

pub use error::{RecognitionError, Result};
