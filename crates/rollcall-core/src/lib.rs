//! rollcall-core: Face identity pipeline for attendance tracking.
//!
//! Enrollment stores labelled face crops, training turns them into a
//! versioned model bundle, and recognition classifies live frames against
//! the current bundle. Detection and classification are pluggable through
//! [`FaceDetector`] and [`FaceClassifier`]; SCRFD and ArcFace implementations
//! running on ONNX Runtime are included.

use std::sync::{Arc, Mutex};

pub mod classifier;
pub mod dataset;
pub mod detector;
pub mod enrollment;
pub mod error;
pub mod identity;
pub mod recognition;
pub mod training;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{EmbeddingClassifier, FaceClassifier};
pub use dataset::Dataset;
pub use detector::{FaceDetector, ScrfdDetector};
pub use enrollment::{Enrollment, EnrollmentManager};
pub use error::{ErrorKind, PipelineError};
pub use identity::{IdentityStore, LabelMapping, LabelRef, ModelBundle, ModelVersion};
pub use recognition::{FaceLabel, Recognition, RecognitionEngine, UNKNOWN};
pub use training::{TrainingManager, TrainingReport};
pub use types::{BoundingBox, DetectionParams, Embedding, ModelState, Prediction};

/// Detector shared between enrollment, training and the live loop.
pub type SharedDetector = Arc<Mutex<Box<dyn FaceDetector>>>;

/// Classifier shared between training and the live loop.
pub type SharedClassifier = Arc<Mutex<Box<dyn FaceClassifier>>>;

/// Wrap a detector for sharing.
pub fn shared_detector(detector: impl FaceDetector + 'static) -> SharedDetector {
    let boxed: Box<dyn FaceDetector> = Box::new(detector);
    Arc::new(Mutex::new(boxed))
}

/// Wrap a classifier for sharing.
pub fn shared_classifier(classifier: impl FaceClassifier + 'static) -> SharedClassifier {
    let boxed: Box<dyn FaceClassifier> = Box::new(classifier);
    Arc::new(Mutex::new(boxed))
}
