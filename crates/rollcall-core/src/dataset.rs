//! On-disk sample dataset.
//!
//! Each sample is a grayscale PNG named `{name}.{index}.png` directly under
//! the dataset root. Samples are only ever appended.

use image::{GrayImage, ImageFormat};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SAMPLE_EXTENSION: &str = "png";

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// A persisted sample, addressed by name and 1-based index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRef {
    pub name: String,
    pub index: u32,
    pub path: PathBuf,
}

/// Directory of labelled face crops.
#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
}

impl Dataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the dataset directory has been created yet.
    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// All samples, ordered by name then index.
    ///
    /// Files that do not follow the `{name}.{index}.png` pattern are ignored.
    /// A missing directory yields an empty list.
    pub fn samples(&self) -> Result<Vec<SampleRef>, DatasetError> {
        if !self.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.root).map_err(|source| DatasetError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut samples = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DatasetError::Io {
                path: self.root.clone(),
                source,
            })?;
            let file_name = entry.file_name();
            let Some((name, index)) = file_name.to_str().and_then(parse_sample_file_name) else {
                continue;
            };
            samples.push(SampleRef { name, index, path: entry.path() });
        }

        samples.sort_by(|a, b| a.name.cmp(&b.name).then(a.index.cmp(&b.index)));
        Ok(samples)
    }

    /// Number of samples already stored for exactly `name`.
    pub fn count_for(&self, name: &str) -> Result<usize, DatasetError> {
        Ok(self.samples()?.iter().filter(|s| s.name == name).count())
    }

    /// Write `count` copies of `face` as `name` with indices starting at `first_index`.
    ///
    /// On a write failure, files already written by this call are removed.
    pub fn append_batch(
        &self,
        name: &str,
        first_index: u32,
        face: &GrayImage,
        count: usize,
    ) -> Result<Vec<SampleRef>, DatasetError> {
        std::fs::create_dir_all(&self.root).map_err(|source| DatasetError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut written: Vec<SampleRef> = Vec::with_capacity(count);
        for index in (first_index..).take(count) {
            let path = self.root.join(sample_file_name(name, index));
            if let Err(source) = face.save_with_format(&path, ImageFormat::Png) {
                for sample in &written {
                    let _ = std::fs::remove_file(&sample.path);
                }
                return Err(DatasetError::Image { path, source });
            }
            written.push(SampleRef { name: name.to_string(), index, path });
        }

        Ok(written)
    }

    /// Read a stored sample back as grayscale.
    pub fn load(&self, sample: &SampleRef) -> Result<GrayImage, DatasetError> {
        let img = image::open(&sample.path).map_err(|source| DatasetError::Image {
            path: sample.path.clone(),
            source,
        })?;
        Ok(img.to_luma8())
    }
}

pub fn sample_file_name(name: &str, index: u32) -> String {
    format!("{name}.{index}.{SAMPLE_EXTENSION}")
}

fn parse_sample_file_name(file_name: &str) -> Option<(String, u32)> {
    let stem = file_name.strip_suffix(SAMPLE_EXTENSION)?.strip_suffix('.')?;
    let (name, index) = stem.rsplit_once('.')?;
    if name.is_empty() || name.contains('.') {
        return None;
    }
    Some((name.to_string(), index.parse().ok()?))
}
