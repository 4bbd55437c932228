//! Enrollment: turn the latest camera frame into labelled samples.

use crate::dataset::Dataset;
use crate::detector::crop;
use crate::error::PipelineError;
use crate::types::DetectionParams;
use crate::SharedDetector;
use image::RgbImage;
use std::sync::{Arc, Mutex, PoisonError};

/// Outcome of a successful [`EnrollmentManager::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    /// Sanitized name the samples were stored under.
    pub name: String,
    pub first_index: u32,
    pub written: usize,
}

/// Writes labelled face samples into the dataset.
pub struct EnrollmentManager {
    detector: SharedDetector,
    dataset: Arc<Dataset>,
    params: DetectionParams,
    /// Held from picking the first index until the batch is on disk.
    write_lock: Mutex<()>,
}

impl EnrollmentManager {
    pub fn new(detector: SharedDetector, dataset: Arc<Dataset>, params: DetectionParams) -> Self {
        Self {
            detector,
            dataset,
            params,
            write_lock: Mutex::new(()),
        }
    }

    /// Store `max_samples` copies of the single face visible in `frame` under `name`.
    ///
    /// Every check runs before the first write: a frame with zero or several
    /// faces, or a name with no usable characters, leaves the dataset untouched.
    /// Indices continue after the samples already stored for the same name.
    ///
    /// The one detected crop is replicated rather than sampled over several
    /// frames, so a batch carries no pose or lighting variety.
    pub fn register(
        &self,
        name: &str,
        frame: Option<&RgbImage>,
        max_samples: usize,
    ) -> Result<Enrollment, PipelineError> {
        let frame = frame.ok_or(PipelineError::NoFrameAvailable)?;
        let gray = image::imageops::grayscale(frame);

        let faces = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(&gray, &self.params)?;

        let face = match faces.as_slice() {
            [] => return Err(PipelineError::NoFaceDetected),
            [face] => face,
            many => return Err(PipelineError::MultipleFacesDetected(many.len())),
        };

        let safe_name =
            sanitize_name(name).ok_or_else(|| PipelineError::InvalidName(name.to_string()))?;

        let region = crop(&gray, face).ok_or(PipelineError::NoFaceDetected)?;

        let (first_index, written) = {
            let _write = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let first_index = self.dataset.count_for(&safe_name)? as u32 + 1;
            let written = self
                .dataset
                .append_batch(&safe_name, first_index, &region, max_samples)?;
            (first_index, written)
        };

        tracing::info!(
            name = %safe_name,
            first_index,
            count = written.len(),
            width = region.width(),
            height = region.height(),
            "enrolled face samples"
        );

        Ok(Enrollment {
            name: safe_name,
            first_index,
            written: written.len(),
        })
    }
}

/// Keep only alphanumerics, `_` and `-`. `None` if nothing is left.
pub fn sanitize_name(name: &str) -> Option<String> {
    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (!safe.is_empty()).then_some(safe)
}
