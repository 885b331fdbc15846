//! Reference photo directory.

use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("photo directory {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write photo {path}: {source}")]
    Encode {
        path: String,
        source: image::ImageError,
    },
}

/// Stores one JPEG per student as `<dir>/<student_id>.jpg`.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    dir: PathBuf,
}

/// A photo written under a temporary name. It only appears at its final
/// path once [`PhotoStore::commit`] succeeds.
#[derive(Debug)]
pub struct StagedPhoto {
    temp: PathBuf,
    path: PathBuf,
}

impl StagedPhoto {
    /// Where the photo will live after commit.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PhotoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a student's photo is stored at.
    ///
    /// ASCII letters, digits and `-` are kept; every other byte of the id
    /// becomes `_XX` (upper-case hex), so distinct ids never share a file.
    pub fn path_for(&self, student_id: &str) -> PathBuf {
        let mut stem = String::with_capacity(student_id.len());
        for b in student_id.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' {
                stem.push(b as char);
            } else {
                stem.push_str(&format!("_{b:02X}"));
            }
        }
        self.dir.join(format!("{stem}.jpg"))
    }

    /// Encode a student's photo next to its final path without replacing
    /// whatever is there now.
    pub fn stage(&self, student_id: &str, photo: &RgbImage) -> Result<StagedPhoto, PhotoError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| PhotoError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;
        let path = self.path_for(student_id);
        let temp = path.with_extension(format!("jpg.tmp-{}", uuid::Uuid::new_v4()));
        photo
            .save_with_format(&temp, image::ImageFormat::Jpeg)
            .map_err(|source| PhotoError::Encode {
                path: temp.display().to_string(),
                source,
            })?;
        Ok(StagedPhoto { temp, path })
    }

    /// Move a staged photo over its final path. The temporary file is removed
    /// if the move fails.
    pub fn commit(&self, staged: StagedPhoto) -> Result<PathBuf, PhotoError> {
        if let Err(source) = std::fs::rename(&staged.temp, &staged.path) {
            if let Err(e) = self.remove(&staged.temp) {
                tracing::warn!(error = %e, "failed to remove staged photo");
            }
            return Err(PhotoError::Io {
                path: staged.path.display().to_string(),
                source,
            });
        }
        tracing::debug!(path = %staged.path.display(), "saved reference photo");
        Ok(staged.path)
    }

    /// Drop a staged photo, leaving the final path untouched.
    pub fn discard(&self, staged: StagedPhoto) -> Result<(), PhotoError> {
        self.remove(&staged.temp)
    }

    /// Delete one photo. A missing file is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), PhotoError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PhotoError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Delete every file in the photo directory, returning how many were removed.
    /// A missing directory counts as empty.
    pub fn purge(&self) -> Result<usize, PhotoError> {
        let io_err = |source| PhotoError::Io {
            path: self.dir.display().to_string(),
            source,
        };
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(e)),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() {
                self.remove(&path)?;
                removed += 1;
            }
        }
        tracing::info!(removed, dir = %self.dir.display(), "purged reference photos");
        Ok(removed)
    }
}
