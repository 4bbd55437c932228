//! Training: rebuild the classifier from every stored sample.

use crate::dataset::Dataset;
use crate::detector::crop;
use crate::error::PipelineError;
use crate::identity::{IdentityStore, LabelMapping, ModelVersion};
use crate::types::{DetectionParams, TrainingExample};
use crate::{SharedClassifier, SharedDetector};
use std::sync::{Arc, Mutex, PoisonError};

/// Summary of a successful training run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingReport {
    pub version: ModelVersion,
    pub identities: usize,
    pub samples: usize,
    pub examples: usize,
    /// Samples that could not be read or contained no detectable face.
    pub skipped: usize,
}

pub struct TrainingManager {
    detector: SharedDetector,
    classifier: SharedClassifier,
    dataset: Arc<Dataset>,
    identities: Arc<IdentityStore>,
    params: DetectionParams,
    /// Serializes whole training runs.
    run_lock: Mutex<()>,
}

impl TrainingManager {
    pub fn new(
        detector: SharedDetector,
        classifier: SharedClassifier,
        dataset: Arc<Dataset>,
        identities: Arc<IdentityStore>,
        params: DetectionParams,
    ) -> Self {
        Self {
            detector,
            classifier,
            dataset,
            identities,
            params,
            run_lock: Mutex::new(()),
        }
    }

    /// Train a new model from the whole dataset and publish it with a fresh
    /// label mapping.
    ///
    /// Label ids are handed out from 1 in sample order, one per distinct name.
    /// Each sample is re-run through the detector and every region found
    /// becomes one training example; samples without a region are skipped.
    pub fn train(&self) -> Result<TrainingReport, PipelineError> {
        let _run = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.dataset.exists() {
            return Err(PipelineError::DatasetMissing(
                self.dataset.root().display().to_string(),
            ));
        }

        let samples = self.dataset.samples()?;
        if samples.is_empty() {
            return Err(PipelineError::DatasetEmpty);
        }

        let mut mapping = LabelMapping::new();
        let mut examples = Vec::new();
        let mut skipped = 0usize;

        for sample in &samples {
            let label = mapping.assign(&sample.name);

            let gray = match self.dataset.load(sample) {
                Ok(gray) => gray,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable sample");
                    skipped += 1;
                    continue;
                }
            };

            let faces = self
                .detector
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .detect(&gray, &self.params)?;

            let before = examples.len();
            examples.extend(
                faces
                    .iter()
                    .filter_map(|face| crop(&gray, face))
                    .map(|face| TrainingExample { label, face }),
            );
            if examples.len() == before {
                tracing::debug!(name = %sample.name, index = sample.index, "no face in sample");
                skipped += 1;
            }
        }

        if examples.is_empty() {
            return Err(PipelineError::NoTrainableFaces);
        }

        let model = self
            .classifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .train(&examples)?;

        let identities = mapping.len();
        let bundle = self.identities.publish(mapping, model)?;

        let report = TrainingReport {
            version: bundle.version,
            identities,
            samples: samples.len(),
            examples: examples.len(),
            skipped,
        };
        tracing::info!(
            version = %report.version,
            identities = report.identities,
            samples = report.samples,
            examples = report.examples,
            skipped = report.skipped,
            "training complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixed_detector, full_frame_detector, mean_classifier};
    use image::GrayImage;

    struct Fixture {
        _dir: tempfile::TempDir,
        dataset: Arc<Dataset>,
        identities: Arc<IdentityStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Arc::new(Dataset::new(dir.path().join("dataset")));
        let identities = Arc::new(IdentityStore::open(dir.path().join("trainer")));
        Fixture { _dir: dir, dataset, identities }
    }

    fn trainer(f: &Fixture, detector: SharedDetector) -> TrainingManager {
        TrainingManager::new(
            detector,
            mean_classifier(),
            f.dataset.clone(),
            f.identities.clone(),
            DetectionParams::RECOGNITION,
        )
    }

    fn face(value: u8) -> GrayImage {
        GrayImage::from_pixel(16, 16, image::Luma([value]))
    }

    #[test]
    fn test_train_without_dataset_dir() {
        let f = fixture();
        let err = trainer(&f, full_frame_detector()).train().unwrap_err();
        assert!(matches!(err, PipelineError::DatasetMissing(_)));
        assert!(f.identities.current().is_none());
    }

    #[test]
    fn test_train_with_empty_dataset_dir() {
        let f = fixture();
        std::fs::create_dir_all(f.dataset.root()).unwrap();
        std::fs::write(f.dataset.root().join("README"), "not a sample").unwrap();
        let err = trainer(&f, full_frame_detector()).train().unwrap_err();
        assert!(matches!(err, PipelineError::DatasetEmpty));
    }

    #[test]
    fn test_train_assigns_labels_in_sample_order() {
        let f = fixture();
        f.dataset.append_batch("bob", 1, &face(200), 2).unwrap();
        f.dataset.append_batch("alice", 1, &face(40), 3).unwrap();

        let report = trainer(&f, full_frame_detector()).train().unwrap();
        assert_eq!(report.version, ModelVersion(1));
        assert_eq!(report.identities, 2);
        assert_eq!(report.samples, 5);
        assert_eq!(report.examples, 5);
        assert_eq!(report.skipped, 0);

        let bundle = f.identities.current().unwrap();
        assert_eq!(bundle.mapping.id_for("alice"), Some(1));
        assert_eq!(bundle.mapping.id_for("bob"), Some(2));
        assert_eq!(bundle.model.templates.len(), 5);
    }

    #[test]
    fn test_samples_without_faces_are_skipped() {
        let f = fixture();
        f.dataset.append_batch("alice", 1, &face(40), 2).unwrap();

        let err = trainer(&f, fixed_detector(vec![])).train().unwrap_err();
        assert!(matches!(err, PipelineError::NoTrainableFaces));
        assert!(f.identities.current().is_none());
    }

    #[test]
    fn test_unreadable_sample_is_skipped() {
        let f = fixture();
        f.dataset.append_batch("alice", 1, &face(40), 1).unwrap();
        std::fs::write(f.dataset.root().join("bob.1.png"), b"not an image").unwrap();

        let report = trainer(&f, full_frame_detector()).train().unwrap();
        assert_eq!(report.examples, 1);
        assert_eq!(report.skipped, 1);
        // bob still gets an id even though none of its samples trained.
        let bundle = f.identities.current().unwrap();
        assert_eq!(bundle.mapping.id_for("bob"), Some(2));
    }

    #[test]
    fn test_retrain_replaces_mapping_and_bumps_version() {
        let f = fixture();
        f.dataset.append_batch("carol", 1, &face(90), 1).unwrap();
        let manager = trainer(&f, full_frame_detector());
        manager.train().unwrap();
        assert_eq!(f.identities.current().unwrap().mapping.id_for("carol"), Some(1));

        f.dataset.append_batch("alice", 1, &face(40), 1).unwrap();
        let report = manager.train().unwrap();
        assert_eq!(report.version, ModelVersion(2));

        let bundle = f.identities.current().unwrap();
        assert_eq!(bundle.mapping.id_for("alice"), Some(1));
        assert_eq!(bundle.mapping.id_for("carol"), Some(2));
    }
}
