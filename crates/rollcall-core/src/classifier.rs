//! Face classification capability and its ArcFace-backed implementation.
//!
//! [`EmbeddingClassifier`] turns each face crop into a 512-dimensional
//! ArcFace embedding. Training stores one labelled template per example;
//! prediction returns the nearest template and a distance on a 0–200 scale
//! where lower means closer.

use crate::types::{Embedding, LabelId, ModelState, Prediction, Template, TrainingExample};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FACE_SIDE: u32 = 112;
/// ArcFace normalizes symmetrically around 127.5.
const PIXEL_CENTER: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;
const CLASSIFIER_NAME: &str = "arcface-w600k_r50";

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("no training examples")]
    NoExamples,
    #[error("model was trained by {found}, expected {expected}")]
    IncompatibleModel { expected: String, found: String },
    #[error("trained model has no templates")]
    EmptyModel,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Trainable mapping from a face crop to a label.
pub trait FaceClassifier: Send {
    /// Fit a fresh model from labelled examples. Never mutates a previous model.
    fn train(&mut self, examples: &[TrainingExample]) -> Result<ModelState, ClassifierError>;

    /// Score `region` against `model`, returning the best label and its distance.
    fn predict(&mut self, model: &ModelState, region: &GrayImage)
        -> Result<Prediction, ClassifierError>;
}

/// Nearest-template lookup shared by embedding-based classifiers.
///
/// `distance` maps a similarity to the classifier's distance scale.
pub fn nearest_template(
    model: &ModelState,
    query: &Embedding,
    distance: impl Fn(&Embedding, &Embedding) -> f32,
) -> Result<Prediction, ClassifierError> {
    let mut best: Option<(LabelId, f32)> = None;

    for template in &model.templates {
        let d = distance(query, &template.embedding);
        if best.map_or(true, |(_, best_d)| d < best_d) {
            best = Some((template.label, d));
        }
    }

    best.map(|(label, distance)| Prediction { label, distance })
        .ok_or(ClassifierError::EmptyModel)
}

/// Distance derived from cosine similarity: 0 for identical, 100 for
/// orthogonal, 200 for opposite embeddings.
pub fn cosine_distance(a: &Embedding, b: &Embedding) -> f32 {
    (1.0 - a.similarity(b)) * 100.0
}

/// ArcFace embedding classifier.
pub struct EmbeddingClassifier {
    session: Session,
}

impl EmbeddingClassifier {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ClassifierError> {
        if !Path::new(model_path).exists() {
            return Err(ClassifierError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract an L2-normalized embedding from a face crop of any size.
    pub fn embed(&mut self, face: &GrayImage) -> Result<Embedding, ClassifierError> {
        let input = Self::preprocess(face);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, values) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("embedding output: {e}")))?;

        if values.len() != EMBEDDING_DIM {
            return Err(ClassifierError::InferenceFailed(format!(
                "embedding has {} values, expected {EMBEDDING_DIM}",
                values.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(values.to_vec()),
        })
    }

    /// Resize a grayscale crop to 112x112 and spread it over three NCHW channels.
    fn preprocess(face: &GrayImage) -> Array4<f32> {
        let resized = imageops::resize(face, FACE_SIDE, FACE_SIDE, FilterType::Triangle);
        let side = FACE_SIDE as usize;
        Array4::from_shape_fn((1, 3, side, side), |(_, _, y, x)| {
            (resized.get_pixel(x as u32, y as u32)[0] as f32 - PIXEL_CENTER) / PIXEL_CENTER
        })
    }
}

impl FaceClassifier for EmbeddingClassifier {
    fn train(&mut self, examples: &[TrainingExample]) -> Result<ModelState, ClassifierError> {
        if examples.is_empty() {
            return Err(ClassifierError::NoExamples);
        }

        let mut templates = Vec::with_capacity(examples.len());
        for example in examples {
            templates.push(Template {
                label: example.label,
                embedding: self.embed(&example.face)?,
            });
        }

        Ok(ModelState {
            classifier: CLASSIFIER_NAME.to_string(),
            templates,
        })
    }

    fn predict(
        &mut self,
        model: &ModelState,
        region: &GrayImage,
    ) -> Result<Prediction, ClassifierError> {
        if model.classifier != CLASSIFIER_NAME {
            return Err(ClassifierError::IncompatibleModel {
                expected: CLASSIFIER_NAME.to_string(),
                found: model.classifier.clone(),
            });
        }
        let query = self.embed(region)?;
        nearest_template(model, &query, cosine_distance)
    }
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(label: LabelId, values: Vec<f32>) -> Template {
        Template { label, embedding: Embedding { values } }
    }

    #[test]
    fn test_preprocess_output_shape_for_any_crop() {
        let face = GrayImage::from_pixel(37, 51, image::Luma([128]));
        let tensor = EmbeddingClassifier::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_and_channels() {
        let face = GrayImage::from_pixel(112, 112, image::Luma([100]));
        let tensor = EmbeddingClassifier::preprocess(&face);
        let expected = (100.0 - PIXEL_CENTER) / PIXEL_CENTER;
        assert!((tensor[[0, 0, 5, 7]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 5, 7]], tensor[[0, 1, 5, 7]]);
        assert_eq!(tensor[[0, 1, 5, 7]], tensor[[0, 2, 5, 7]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_distance_scale() {
        let a = Embedding { values: vec![1.0, 0.0] };
        let b = Embedding { values: vec![0.0, 1.0] };
        let c = Embedding { values: vec![-1.0, 0.0] };
        assert!(cosine_distance(&a, &a).abs() < 1e-4);
        assert!((cosine_distance(&a, &b) - 100.0).abs() < 1e-4);
        assert!((cosine_distance(&a, &c) - 200.0).abs() < 1e-4);
    }

    #[test]
    fn test_nearest_template_picks_closest() {
        let model = ModelState {
            classifier: CLASSIFIER_NAME.into(),
            templates: vec![
                template(1, vec![0.0, 1.0]),
                template(2, vec![1.0, 0.1]),
                template(3, vec![-1.0, 0.0]),
            ],
        };
        let query = Embedding { values: vec![1.0, 0.0] };
        let p = nearest_template(&model, &query, cosine_distance).unwrap();
        assert_eq!(p.label, 2);
        assert!(p.distance < 1.0);
    }

    #[test]
    fn test_nearest_template_empty_model() {
        let model = ModelState { classifier: CLASSIFIER_NAME.into(), templates: vec![] };
        let query = Embedding { values: vec![1.0] };
        assert!(matches!(
            nearest_template(&model, &query, cosine_distance),
            Err(ClassifierError::EmptyModel)
        ));
    }
}
