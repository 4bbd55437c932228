use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Classifier-internal identity number. Only meaningful together with the
/// model version that assigned it; see [`crate::identity::LabelRef`].
pub type LabelId = u32;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box covering a whole `width` x `height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 1.0,
            landmarks: None,
        }
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to an image of the given size.
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn clamp_to(&self, img_width: u32, img_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(img_width as f32).ceil();
        let y1 = (self.y + self.height).min(img_height as f32).ceil();

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    /// Overlap ratio (intersection over union) with `other`, 0.0 when disjoint.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let overlap_w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let overlap_h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        let inter = overlap_w.max(0.0) * overlap_h.max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Detector tuning for one call site.
///
/// Enrollment uses a stricter profile than recognition and training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Minimum detector score for a candidate box.
    pub confidence_threshold: f32,
    /// IoU above which overlapping boxes are suppressed.
    pub nms_threshold: f32,
    /// Boxes with a side shorter than this (pixels) are dropped.
    pub min_face_size: u32,
}

impl DetectionParams {
    pub const RECOGNITION: Self = Self {
        confidence_threshold: 0.5,
        nms_threshold: 0.4,
        min_face_size: 24,
    };

    pub const ENROLLMENT: Self = Self {
        confidence_threshold: 0.6,
        nms_threshold: 0.4,
        min_face_size: 24,
    };
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self::RECOGNITION
    }
}

/// Face feature vector produced by a classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// One cropped grayscale face tagged with the label it should train.
#[derive(Debug, Clone)]
pub struct TrainingExample {
    pub label: LabelId,
    pub face: GrayImage,
}

/// A labelled reference point inside a trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub label: LabelId,
    pub embedding: Embedding,
}

/// Opaque trained classifier state. Produced by `FaceClassifier::train`,
/// consumed by `FaceClassifier::predict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    /// Name of the classifier that produced the templates.
    pub classifier: String,
    pub templates: Vec<Template>,
}

/// Classifier verdict for a single face region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: LabelId,
    /// Lower = closer match.
    pub distance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_clamp_inside() {
        assert_eq!(bbox(10.0, 20.0, 30.0, 40.0).clamp_to(100, 100), Some((10, 20, 30, 40)));
    }

    #[test]
    fn test_clamp_overhanging_edges() {
        assert_eq!(bbox(-5.0, -5.0, 20.0, 20.0).clamp_to(100, 100), Some((0, 0, 15, 15)));
        assert_eq!(bbox(90.0, 90.0, 20.0, 20.0).clamp_to(100, 100), Some((90, 90, 10, 10)));
    }

    #[test]
    fn test_clamp_outside() {
        assert_eq!(bbox(120.0, 0.0, 10.0, 10.0).clamp_to(100, 100), None);
        assert_eq!(bbox(0.0, 0.0, 0.0, 10.0).clamp_to(100, 100), None);
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        // 5x10 overlap over a 150 union.
        assert!((a.iou(&bbox(5.0, 0.0, 10.0, 10.0)) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&bbox(20.0, 20.0, 5.0, 5.0)), 0.0);
    }

    #[test]
    fn test_full_box() {
        assert_eq!(BoundingBox::full(64, 48).clamp_to(64, 48), Some((0, 0, 64, 48)));
    }

    #[test]
    fn test_similarity_identical_and_orthogonal() {
        let a = Embedding { values: vec![1.0, 0.0] };
        let b = Embedding { values: vec![0.0, 1.0] };
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = Embedding { values: vec![0.0, 0.0] };
        let b = Embedding { values: vec![1.0, 0.0] };
        assert_eq!(a.similarity(&b), 0.0);
    }
}
