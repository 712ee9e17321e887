//! Per-batch scratch files for downloaded images.

use image::{DynamicImage, ImageFormat};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("scratch io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Owns every temp image a batch creates. Files, and the directory if this
/// value created it, are removed by [`ScratchSpace::cleanup`] or, failing
/// that, when the value is dropped.
pub struct ScratchSpace {
    dir: PathBuf,
    owns_dir: bool,
    files: Vec<NamedTempFile>,
    created: usize,
}

impl ScratchSpace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            owns_dir: false,
            files: Vec::new(),
            created: 0,
        }
    }

    pub fn created(&self) -> usize {
        self.created
    }

    /// Writes `image` as an RGB JPEG under a unique name and keeps ownership
    /// of the file.
    pub fn persist_image(&mut self, image: &DynamicImage, stem: &str) -> Result<PathBuf, ScratchError> {
        if !self.owns_dir && !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            self.owns_dir = true;
        }
        let prefix = format!("appraisal_{}_", sanitize_stem(stem));
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".jpg")
            .tempfile_in(&self.dir)?;
        DynamicImage::ImageRgb8(image.to_rgb8()).write_to(file.as_file_mut(), ImageFormat::Jpeg)?;
        let path = file.path().to_path_buf();
        self.files.push(file);
        self.created += 1;
        Ok(path)
    }

    /// Removes all files still owned, then the directory if it was created
    /// here. Returns how many entries could not be removed.
    pub fn cleanup(&mut self) -> usize {
        let mut failures = 0;
        for file in self.files.drain(..) {
            let path = file.path().to_path_buf();
            if let Err(err) = file.close() {
                failures += 1;
                warn!(
                    target = "appraisal.pipeline",
                    path = %path.display(),
                    error = %err,
                    "temp_file_remove_failed"
                );
            }
        }
        if self.owns_dir {
            self.owns_dir = false;
            match std::fs::remove_dir(&self.dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    failures += 1;
                    warn!(
                        target = "appraisal.pipeline",
                        path = %self.dir.display(),
                        error = %err,
                        "scratch_dir_remove_failed"
                    );
                }
            }
        }
        failures
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn sanitize_stem(stem: &str) -> String {
    stem.chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
        .take(48)
        .collect()
}
