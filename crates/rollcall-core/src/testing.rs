//! Deterministic stand-ins for the detector and classifier.

use crate::classifier::{nearest_template, ClassifierError, FaceClassifier};
use crate::detector::{DetectorError, FaceDetector};
use crate::types::{BoundingBox, DetectionParams, Embedding, ModelState, Prediction, Template, TrainingExample};
use crate::{SharedClassifier, SharedDetector};
use image::{GrayImage, Rgb, RgbImage};
use std::sync::{Arc, Mutex};

pub fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
    BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
}

/// Detector driven by a closure over the input image.
pub struct FnDetector<F>(pub F);

impl<F> FaceDetector for FnDetector<F>
where
    F: FnMut(&GrayImage) -> Vec<BoundingBox> + Send,
{
    fn detect(&mut self, gray: &GrayImage, _: &DetectionParams) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok((self.0)(gray))
    }
}

/// Detector that always reports the same boxes.
pub fn fixed_detector(boxes: Vec<BoundingBox>) -> SharedDetector {
    let detector: Box<dyn FaceDetector> = Box::new(FnDetector(move |_: &GrayImage| boxes.clone()));
    Arc::new(Mutex::new(detector))
}

/// Detector that reports the whole image as one face.
pub fn full_frame_detector() -> SharedDetector {
    let detector: Box<dyn FaceDetector> = Box::new(FnDetector(|g: &GrayImage| {
        vec![BoundingBox::full(g.width(), g.height())]
    }));
    Arc::new(Mutex::new(detector))
}

/// Detector that always fails.
pub struct BrokenDetector;

impl FaceDetector for BrokenDetector {
    fn detect(&mut self, _: &GrayImage, _: &DetectionParams) -> Result<Vec<BoundingBox>, DetectorError> {
        Err(DetectorError::InferenceFailed("broken".into()))
    }
}

/// Classifier whose embedding is the mean intensity of the crop (0–255).
/// Distance is the absolute intensity difference to the nearest template.
pub struct MeanIntensityClassifier;

impl MeanIntensityClassifier {
    fn embed(face: &GrayImage) -> Embedding {
        let n = (face.width() * face.height()).max(1) as f32;
        let mean = face.pixels().map(|p| p[0] as f32).sum::<f32>() / n;
        Embedding { values: vec![mean] }
    }
}

impl FaceClassifier for MeanIntensityClassifier {
    fn train(&mut self, examples: &[TrainingExample]) -> Result<ModelState, ClassifierError> {
        if examples.is_empty() {
            return Err(ClassifierError::NoExamples);
        }
        Ok(ModelState {
            classifier: "mean-intensity".into(),
            templates: examples
                .iter()
                .map(|e| Template { label: e.label, embedding: Self::embed(&e.face) })
                .collect(),
        })
    }

    fn predict(&mut self, model: &ModelState, region: &GrayImage) -> Result<Prediction, ClassifierError> {
        nearest_template(model, &Self::embed(region), |a, b| (a.values[0] - b.values[0]).abs())
    }
}

pub fn mean_classifier() -> SharedClassifier {
    let classifier: Box<dyn FaceClassifier> = Box::new(MeanIntensityClassifier);
    Arc::new(Mutex::new(classifier))
}

/// Gray frame with each `(x, y, size, value)` square painted in.
pub fn frame_with_faces(width: u32, height: u32, faces: &[(u32, u32, u32, u8)]) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
    for &(fx, fy, size, value) in faces {
        for y in fy..(fy + size).min(height) {
            for x in fx..(fx + size).min(width) {
                img.put_pixel(x, y, Rgb([value, value, value]));
            }
        }
    }
    img
}
