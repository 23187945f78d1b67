use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

const MODEL_DIR: &str = "models";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    PalmDetector,
    HandposeEstimator,
    FaceLandmarker,
    PoseLandmarker,
}

impl ModelKind {
    pub fn label(self) -> &'static str {
        match self {
            ModelKind::PalmDetector => "palm detector",
            ModelKind::HandposeEstimator => "handpose estimator",
            ModelKind::FaceLandmarker => "face landmarker",
            ModelKind::PoseLandmarker => "pose landmarker",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ModelKind::PalmDetector => "palm_detection_mediapipe_2023feb.onnx",
            ModelKind::HandposeEstimator => "handpose_estimation_mediapipe_2023feb.onnx",
            ModelKind::FaceLandmarker => "face_landmarker.onnx",
            ModelKind::PoseLandmarker => "pose_landmarker_lite.onnx",
        }
    }

    /// Where the model can be fetched from, if it is published anywhere.
    pub fn url(self) -> Option<&'static str> {
        match self {
            ModelKind::PalmDetector => Some(
                "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/palm_detection_mediapipe_2023feb.onnx",
            ),
            ModelKind::HandposeEstimator => Some(
                "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/handpose_estimation_mediapipe_2023feb.onnx",
            ),
            ModelKind::FaceLandmarker | ModelKind::PoseLandmarker => None,
        }
    }

    pub fn default_path(self) -> PathBuf {
        PathBuf::from(MODEL_DIR).join(self.file_name())
    }
}

#[derive(Clone, Debug)]
pub enum ModelDownloadEvent {
    AlreadyPresent {
        model: ModelKind,
    },
    Started {
        model: ModelKind,
        total: Option<u64>,
    },
    Progress {
        model: ModelKind,
        downloaded: u64,
        total: Option<u64>,
    },
    Finished {
        model: ModelKind,
    },
}

/// Makes sure `model_path` exists, downloading it with a progress bar when
/// allowed and a download location is known.
pub fn ensure_model_ready(kind: ModelKind, model_path: &Path, download: bool) -> anyhow::Result<()> {
    let mut progress: Option<ProgressBar> = None;
    ensure_model_ready_with(kind, model_path, download, |event| match event {
        ModelDownloadEvent::Started { total, .. } => {
            progress = Some(create_progress_bar(total));
        }
        ModelDownloadEvent::Progress { downloaded, .. } => {
            if let Some(pb) = progress.as_ref() {
                pb.set_position(downloaded);
            }
        }
        ModelDownloadEvent::Finished { model } => {
            if let Some(pb) = progress.take() {
                pb.finish_with_message(format!("{} model ready", model.label()));
            }
        }
        ModelDownloadEvent::AlreadyPresent { .. } => {}
    })
}

pub fn ensure_model_ready_with<F>(
    kind: ModelKind,
    model_path: &Path,
    download: bool,
    mut on_event: F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    if model_path.exists() {
        on_event(ModelDownloadEvent::AlreadyPresent { model: kind });
        return Ok(());
    }

    let url = match kind.url() {
        Some(url) if download => url,
        Some(_) => {
            return Err(anyhow!(
                "{} model not found at {} and downloads are disabled",
                kind.label(),
                model_path.display()
            ));
        }
        None => {
            return Err(anyhow!(
                "{} model not found at {}; it must be provided locally",
                kind.label(),
                model_path.display()
            ));
        }
    };

    if let Some(parent) = model_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    download_to_path(kind, url, model_path, &mut on_event).with_context(|| {
        format!(
            "failed to download {} model to {}",
            kind.label(),
            model_path.display()
        )
    })
}

fn download_to_path<F>(
    model: ModelKind,
    url: &str,
    dest: &Path,
    on_event: &mut F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    log::info!(
        "downloading {} model from {url} to {}",
        model.label(),
        dest.display()
    );

    let client = Client::new();
    let mut response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total_size = response.content_length();
    on_event(ModelDownloadEvent::Started {
        model,
        total: total_size,
    });

    let tmp_path = dest.with_extension("download");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        on_event(ModelDownloadEvent::Progress {
            model,
            downloaded,
            total: total_size,
        });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")?;
    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to move temp model {} into place at {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    on_event(ModelDownloadEvent::Finished { model });
    Ok(())
}

pub(crate) fn create_progress_bar(total_size: Option<u64>) -> ProgressBar {
    match total_size {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            ) {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} downloading model") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_model_is_reported_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.onnx");
        fs::write(&path, b"stub").unwrap();

        let mut events = Vec::new();
        ensure_model_ready_with(ModelKind::FaceLandmarker, &path, false, |e| events.push(e))
            .unwrap();
        assert!(matches!(
            events.as_slice(),
            [ModelDownloadEvent::AlreadyPresent {
                model: ModelKind::FaceLandmarker
            }]
        ));
    }

    #[test]
    fn local_only_models_fail_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pose.onnx");
        let err = ensure_model_ready_with(ModelKind::PoseLandmarker, &path, true, |_| {})
            .unwrap_err();
        assert!(err.to_string().contains("provided locally"));
    }

    #[test]
    fn disabled_downloads_fail_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palm.onnx");
        assert!(ensure_model_ready_with(ModelKind::PalmDetector, &path, false, |_| {}).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn default_paths_live_under_models() {
        let path = ModelKind::HandposeEstimator.default_path();
        assert!(path.starts_with("models"));
        assert!(ModelKind::HandposeEstimator.url().is_some());
        assert!(ModelKind::FaceLandmarker.url().is_none());
    }
}
