use crate::classifier::ClassifierError;
use crate::dataset::DatasetError;
use crate::detector::DetectorError;
use crate::identity::IdentityStoreError;
use std::fmt;
use thiserror::Error;

/// Coarse failure category reported to operators alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoFrameAvailable,
    NoFaceDetected,
    MultipleFacesDetected,
    InvalidName,
    DatasetMissing,
    DatasetEmpty,
    NoTrainableFaces,
    UnknownFace,
    DeviceFailure,
    StorageFailure,
    /// A detector or classifier failed while enrolling or training.
    PipelineFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoFrameAvailable => "no-frame-available",
            Self::NoFaceDetected => "no-face-detected",
            Self::MultipleFacesDetected => "multiple-faces-detected",
            Self::InvalidName => "invalid-name",
            Self::DatasetMissing => "dataset-missing",
            Self::DatasetEmpty => "dataset-empty",
            Self::NoTrainableFaces => "no-trainable-faces",
            Self::UnknownFace => "unknown-face",
            Self::DeviceFailure => "device-failure",
            Self::StorageFailure => "storage-failure",
            Self::PipelineFailure => "pipeline-failure",
        };
        f.write_str(s)
    }
}

/// Failures of enrollment and training.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no frame received, start the camera first")]
    NoFrameAvailable,
    #[error("no face detected, try again")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}), only one face allowed")]
    MultipleFacesDetected(usize),
    #[error("invalid name {0:?}: use letters, digits, '_' or '-'")]
    InvalidName(String),
    #[error("dataset folder not found at {0}, register faces first")]
    DatasetMissing(String),
    #[error("no sample images found, register a face first")]
    DatasetEmpty,
    #[error("no usable faces found in the dataset, register again")]
    NoTrainableFaces,
    #[error("dataset: {0}")]
    Dataset(#[from] DatasetError),
    #[error("identity store: {0}")]
    IdentityStore(#[from] IdentityStoreError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoFrameAvailable => ErrorKind::NoFrameAvailable,
            Self::NoFaceDetected => ErrorKind::NoFaceDetected,
            Self::MultipleFacesDetected(_) => ErrorKind::MultipleFacesDetected,
            Self::InvalidName(_) => ErrorKind::InvalidName,
            Self::DatasetMissing(_) => ErrorKind::DatasetMissing,
            Self::DatasetEmpty => ErrorKind::DatasetEmpty,
            Self::NoTrainableFaces => ErrorKind::NoTrainableFaces,
            Self::Dataset(_) | Self::IdentityStore(_) => ErrorKind::StorageFailure,
            Self::Detector(_) | Self::Classifier(_) => ErrorKind::PipelineFailure,
        }
    }
}
