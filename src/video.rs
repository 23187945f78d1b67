use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result as AnyResult, anyhow};
use rayon::prelude::*;

use crate::{
    error::{RecognitionError, Result},
    types::{Frame, Video},
};

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Turns a stored clip into decoded RGBA frames.
pub trait VideoDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> AnyResult<Video>;

    /// Whether `path` looks like something this decoder can read.
    fn accepts(&self, path: &Path) -> bool;
}

/// Decodes with `decoder`, reporting failure as an extraction error.
pub fn decode_video(decoder: &dyn VideoDecoder, path: &Path) -> Result<Video> {
    decoder
        .decode(path)
        .map_err(|err| RecognitionError::extraction(format!("{}: {err:#}", path.display())))
}

/// A clip stored as a directory of still frames, ordered by file name.
#[derive(Clone, Debug)]
pub struct ImageSequenceDecoder {
    pub fps: f32,
}

impl Default for ImageSequenceDecoder {
    fn default() -> Self {
        Self { fps: 30.0 }
    }
}

impl ImageSequenceDecoder {
    pub fn new(fps: f32) -> Self {
        Self { fps }
    }

    fn frame_paths(dir: &Path) -> AnyResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
            let path = entry?.path();
            if path.is_file() && is_frame_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl VideoDecoder for ImageSequenceDecoder {
    fn decode(&self, path: &Path) -> AnyResult<Video> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(anyhow!("invalid frame rate {}", self.fps));
        }
        let paths = Self::frame_paths(path)?;
        if paths.is_empty() {
            return Err(anyhow!("no frames found in {}", path.display()));
        }

        let frames = paths
            .par_iter()
            .map(|p| load_frame(p))
            .collect::<AnyResult<Vec<_>>>()?;

        log::debug!("decoded {} frames from {}", frames.len(), path.display());
        Ok(Video {
            frames,
            fps: self.fps,
        })
    }

    fn accepts(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn load_frame(path: &Path) -> AnyResult<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode frame {}", path.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    Frame::new(image.into_raw(), width, height)
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    use super::*;

    fn write_frame(dir: &Path, name: &str, shade: u8) {
        RgbaImage::from_pixel(6, 4, Rgba([shade, 0, 0, 255]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn frames_are_ordered_by_name() {
        let dir = tempdir().unwrap();
        write_frame(dir.path(), "0002.png", 20);
        write_frame(dir.path(), "0001.png", 10);
        write_frame(dir.path(), "0003.png", 30);
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let decoder = ImageSequenceDecoder::new(12.0);
        assert!(decoder.accepts(dir.path()));
        let video = decode_video(&decoder, dir.path()).unwrap();
        assert_eq!(video.frames.len(), 3);
        assert_eq!(video.fps, 12.0);
        assert_eq!(video.dimensions(), Some((6, 4)));
        let shades: Vec<u8> = video.frames.iter().map(|f| f.rgba[0]).collect();
        assert_eq!(shades, vec![10, 20, 30]);
    }

    #[test]
    fn empty_directory_is_an_extraction_failure() {
        let dir = tempdir().unwrap();
        let err = decode_video(&ImageSequenceDecoder::default(), dir.path()).unwrap_err();
        assert!(matches!(err, RecognitionError::ExtractionFailed(_)));
    }

    #[test]
    fn corrupt_frame_fails_the_clip() {
        let dir = tempdir().unwrap();
        write_frame(dir.path(), "0001.png", 10);
        fs::write(dir.path().join("0002.png"), b"not a png").unwrap();
        assert!(decode_video(&ImageSequenceDecoder::default(), dir.path()).is_err());
    }
}
