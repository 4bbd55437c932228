//! Per-frame recognition: detect, classify, gate on distance, annotate.

use crate::detector::crop;
use crate::identity::{IdentityStore, ModelVersion};
use crate::types::{BoundingBox, DetectionParams};
use crate::{SharedClassifier, SharedDetector};
use ab_glyph::FontArc;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError};

/// Name reported when no face resolved to a known identity.
pub const UNKNOWN: &str = "Unknown";

/// Default acceptance threshold: a prediction is accepted only when its
/// distance is strictly below this value.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 70.0;

const COLOR_KNOWN: Rgb<u8> = Rgb([0, 255, 0]);
const COLOR_UNKNOWN: Rgb<u8> = Rgb([255, 64, 64]);
const COLOR_NOT_TRAINED: Rgb<u8> = Rgb([255, 255, 0]);

const LABEL_FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");
const LABEL_SCALE: f32 = 14.0;
/// Gap between a label and the box edge it sits against.
const LABEL_MARGIN: u32 = 3;

/// Label attached to one detected face.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceLabel {
    NotTrained,
    Unknown,
    Known(String),
}

impl fmt::Display for FaceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTrained => f.write_str("Not Trained"),
            Self::Unknown => f.write_str(UNKNOWN),
            Self::Known(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    pub label: FaceLabel,
    /// Classifier distance, when the face was classified.
    pub distance: Option<f32>,
}

/// Result of recognizing one frame.
#[derive(Debug, Clone)]
pub struct Recognition {
    /// Input frame with a box drawn around every detected face.
    pub annotated: RgbImage,
    /// Last accepted identity in the frame, or [`UNKNOWN`].
    pub name: String,
    pub face_count: usize,
    pub faces: Vec<FaceAnnotation>,
    /// Model the faces were classified with, `None` when untrained.
    pub model_version: Option<ModelVersion>,
}

pub struct RecognitionEngine {
    detector: SharedDetector,
    classifier: SharedClassifier,
    identities: Arc<IdentityStore>,
    params: DetectionParams,
    threshold: f32,
}

impl RecognitionEngine {
    pub fn new(
        detector: SharedDetector,
        classifier: SharedClassifier,
        identities: Arc<IdentityStore>,
        params: DetectionParams,
        threshold: f32,
    ) -> Self {
        Self {
            detector,
            classifier,
            identities,
            params,
            threshold,
        }
    }

    /// Recognize every face in `frame`.
    ///
    /// Never fails: detector errors count as zero faces, classifier errors
    /// label the face [`FaceLabel::Unknown`]. With several known faces the
    /// reported name is the last accepted one in detection order.
    pub fn recognize(&self, frame: &RgbImage) -> Recognition {
        let gray = image::imageops::grayscale(frame);

        let boxes = match self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(&gray, &self.params)
        {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed, treating frame as empty");
                Vec::new()
            }
        };

        let bundle = self.identities.current();
        let mut name = UNKNOWN.to_string();
        let mut faces = Vec::with_capacity(boxes.len());

        match &bundle {
            None => {
                faces.extend(boxes.into_iter().map(|bbox| FaceAnnotation {
                    bbox,
                    label: FaceLabel::NotTrained,
                    distance: None,
                }));
            }
            Some(bundle) => {
                let mut classifier = self.classifier.lock().unwrap_or_else(PoisonError::into_inner);
                for bbox in boxes {
                    let Some(region) = crop(&gray, &bbox) else {
                        faces.push(FaceAnnotation { bbox, label: FaceLabel::Unknown, distance: None });
                        continue;
                    };

                    let prediction = match classifier.predict(&bundle.model, &region) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(error = %e, "face classification failed");
                            faces.push(FaceAnnotation { bbox, label: FaceLabel::Unknown, distance: None });
                            continue;
                        }
                    };

                    let label = if prediction.distance < self.threshold {
                        let resolved = bundle.resolve(bundle.label_ref(prediction.label));
                        name = resolved.unwrap_or(UNKNOWN).to_string();
                        match resolved {
                            Some(n) => FaceLabel::Known(n.to_string()),
                            None => FaceLabel::Unknown,
                        }
                    } else {
                        FaceLabel::Unknown
                    };

                    faces.push(FaceAnnotation {
                        bbox,
                        label,
                        distance: Some(prediction.distance),
                    });
                }
            }
        }

        let mut annotated = frame.clone();
        annotate(&mut annotated, &faces);

        Recognition {
            annotated,
            name,
            face_count: faces.len(),
            faces,
            model_version: bundle.map(|b| b.version),
        }
    }
}

/// Draw a 2px box around every face, colored by its label, with the label
/// text above the box (inside its top edge when the box touches the frame top).
pub fn annotate(frame: &mut RgbImage, faces: &[FaceAnnotation]) {
    let font = label_font();
    for face in faces {
        let Some((x, y, w, h)) = face.bbox.clamp_to(frame.width(), frame.height()) else {
            continue;
        };
        let color = match face.label {
            FaceLabel::Known(_) => COLOR_KNOWN,
            FaceLabel::Unknown => COLOR_UNKNOWN,
            FaceLabel::NotTrained => COLOR_NOT_TRAINED,
        };
        draw_hollow_rect_mut(frame, Rect::at(x as i32, y as i32).of_size(w, h), color);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(
                frame,
                Rect::at(x as i32 + 1, y as i32 + 1).of_size(w - 2, h - 2),
                color,
            );
        }

        if let Some(font) = font {
            let text = face.label.to_string();
            let (_, text_h) = text_size(LABEL_SCALE, font, &text);
            let (tx, ty) = if y >= text_h + LABEL_MARGIN {
                (x, y - text_h - LABEL_MARGIN)
            } else {
                (x + LABEL_MARGIN, y + LABEL_MARGIN)
            };
            draw_text_mut(frame, color, tx as i32, ty as i32, LABEL_SCALE, font, &text);
        }
    }
}

/// Font for face labels, parsed once.
fn label_font() -> Option<&'static FontArc> {
    static FONT: OnceLock<Option<FontArc>> = OnceLock::new();
    FONT.get_or_init(|| match FontArc::try_from_slice(LABEL_FONT_DATA) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "label font unreadable, drawing boxes only");
            None
        }
    })
    .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::testing::{bbox, fixed_detector, frame_with_faces, full_frame_detector, mean_classifier, BrokenDetector};
    use crate::training::TrainingManager;
    use image::GrayImage;
    use std::sync::Mutex;

    struct Fixture {
        _dir: tempfile::TempDir,
        identities: Arc<IdentityStore>,
    }

    /// Dataset with alice (dark face) and bob (bright face), optionally trained.
    fn fixture(train: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Arc::new(Dataset::new(dir.path().join("dataset")));
        let identities = Arc::new(IdentityStore::open(dir.path().join("trainer")));
        dataset
            .append_batch("alice", 1, &GrayImage::from_pixel(20, 20, image::Luma([40])), 2)
            .unwrap();
        dataset
            .append_batch("bob", 1, &GrayImage::from_pixel(20, 20, image::Luma([200])), 2)
            .unwrap();
        if train {
            TrainingManager::new(
                full_frame_detector(),
                mean_classifier(),
                dataset,
                identities.clone(),
                DetectionParams::RECOGNITION,
            )
            .train()
            .unwrap();
        }
        Fixture { _dir: dir, identities }
    }

    fn engine(f: &Fixture, boxes: Vec<BoundingBox>, threshold: f32) -> RecognitionEngine {
        RecognitionEngine::new(
            fixed_detector(boxes),
            mean_classifier(),
            f.identities.clone(),
            DetectionParams::RECOGNITION,
            threshold,
        )
    }

    #[test]
    fn test_untrained_reports_faces_as_not_trained() {
        let f = fixture(false);
        let frame = frame_with_faces(100, 100, &[(10, 10, 20, 40), (60, 60, 20, 200)]);
        let engine = engine(&f, vec![bbox(10.0, 10.0, 20.0, 20.0), bbox(60.0, 60.0, 20.0, 20.0)], 70.0);

        let r = engine.recognize(&frame);
        assert_eq!(r.name, UNKNOWN);
        assert_eq!(r.face_count, 2);
        assert!(r.faces.iter().all(|a| a.label == FaceLabel::NotTrained));
        assert!(r.model_version.is_none());
        assert_eq!(*r.annotated.get_pixel(10, 10), COLOR_NOT_TRAINED);
    }

    #[test]
    fn test_known_face_under_threshold() {
        let f = fixture(true);
        let frame = frame_with_faces(100, 100, &[(10, 10, 20, 40)]);
        let engine = engine(&f, vec![bbox(10.0, 10.0, 20.0, 20.0)], DEFAULT_CONFIDENCE_THRESHOLD);

        let r = engine.recognize(&frame);
        assert_eq!(r.name, "alice");
        assert_eq!(r.face_count, 1);
        assert_eq!(r.faces[0].label, FaceLabel::Known("alice".into()));
        assert!(r.faces[0].distance.unwrap() < 1.0);
        assert_eq!(*r.annotated.get_pixel(10, 10), COLOR_KNOWN);
        // The input frame is left untouched.
        assert_eq!(*frame.get_pixel(10, 10), Rgb([40, 40, 40]));
    }

    #[test]
    fn test_match_above_threshold_is_unknown() {
        let f = fixture(true);
        let frame = frame_with_faces(100, 100, &[(10, 10, 20, 40)]);
        let engine = engine(&f, vec![bbox(10.0, 10.0, 20.0, 20.0)], 0.0);

        let r = engine.recognize(&frame);
        assert_eq!(r.name, UNKNOWN);
        assert_eq!(r.faces[0].label, FaceLabel::Unknown);
        assert!(r.faces[0].distance.is_some());
    }

    #[test]
    fn test_no_faces() {
        let f = fixture(true);
        let frame = frame_with_faces(64, 64, &[]);
        let r = engine(&f, vec![], 70.0).recognize(&frame);
        assert_eq!(r.name, UNKNOWN);
        assert_eq!(r.face_count, 0);
        assert_eq!(r.model_version, Some(ModelVersion(1)));
    }

    #[test]
    fn test_last_accepted_face_wins() {
        let f = fixture(true);
        let frame = frame_with_faces(100, 100, &[(10, 10, 20, 40), (60, 60, 20, 200)]);
        let engine = engine(&f, vec![bbox(10.0, 10.0, 20.0, 20.0), bbox(60.0, 60.0, 20.0, 20.0)], 70.0);

        let r = engine.recognize(&frame);
        assert_eq!(r.face_count, 2);
        assert_eq!(r.faces[0].label, FaceLabel::Known("alice".into()));
        assert_eq!(r.faces[1].label, FaceLabel::Known("bob".into()));
        assert_eq!(r.name, "bob");
    }

    #[test]
    fn test_unaccepted_later_face_keeps_earlier_name() {
        let f = fixture(true);
        // Second face at 128 sits 72+ away from both templates.
        let frame = frame_with_faces(100, 100, &[(10, 10, 20, 40), (60, 60, 20, 128)]);
        let engine = engine(&f, vec![bbox(10.0, 10.0, 20.0, 20.0), bbox(60.0, 60.0, 20.0, 20.0)], 70.0);

        let r = engine.recognize(&frame);
        assert_eq!(r.faces[1].label, FaceLabel::Unknown);
        assert_eq!(r.name, "alice");
    }

    #[test]
    fn test_detector_failure_is_an_empty_frame() {
        let f = fixture(true);
        let detector: Box<dyn crate::FaceDetector> = Box::new(BrokenDetector);
        let engine = RecognitionEngine::new(
            Arc::new(Mutex::new(detector)),
            mean_classifier(),
            f.identities.clone(),
            DetectionParams::RECOGNITION,
            70.0,
        );
        let r = engine.recognize(&frame_with_faces(32, 32, &[]));
        assert_eq!(r.face_count, 0);
        assert_eq!(r.name, UNKNOWN);
    }

    fn changed_pixels(img: &RgbImage, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) -> usize {
        ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| img.get_pixel(x, y).0 != [0, 0, 0])
            .count()
    }

    #[test]
    fn test_label_text_drawn_above_box() {
        let mut frame = RgbImage::new(120, 90);
        let face = FaceAnnotation {
            bbox: bbox(30.0, 50.0, 30.0, 30.0),
            label: FaceLabel::Known("alice".into()),
            distance: Some(3.0),
        };
        annotate(&mut frame, &[face]);

        assert!(label_font().is_some());
        assert!(changed_pixels(&frame, 30..120, 30..50) > 10, "no label pixels above the box");
        assert_eq!(changed_pixels(&frame, 0..28, 0..90), 0);
        assert_eq!(*frame.get_pixel(30, 50), COLOR_KNOWN);
    }

    #[test]
    fn test_label_moves_inside_box_at_frame_top() {
        let mut frame = RgbImage::new(100, 100);
        let face = FaceAnnotation {
            bbox: bbox(10.0, 0.0, 80.0, 60.0),
            label: FaceLabel::NotTrained,
            distance: None,
        };
        annotate(&mut frame, &[face]);

        // Interior of the box, past the 2px border.
        assert!(changed_pixels(&frame, 12..88, 2..58) > 10);
        assert_eq!(*frame.get_pixel(10, 0), COLOR_NOT_TRAINED);
    }

    #[test]
    fn test_face_label_display() {
        assert_eq!(FaceLabel::NotTrained.to_string(), "Not Trained");
        assert_eq!(FaceLabel::Unknown.to_string(), "Unknown");
        assert_eq!(FaceLabel::Known("ada".into()).to_string(), "ada");
    }
}
