//! Face detection capability and its SCRFD implementation.
//!
//! The pipeline only depends on the [`FaceDetector`] trait. [`ScrfdDetector`]
//! runs the SCRFD model via ONNX Runtime: letterboxed square input, anchor-free
//! decoding on three feature strides, then overlap suppression.

use crate::types::{BoundingBox, DetectionParams};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIDE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 1.0 / 128.0;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const LANDMARK_VALUES: usize = 10;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in a grayscale image.
pub trait FaceDetector: Send {
    /// Return every face box found in `gray`, highest confidence first.
    fn detect(
        &mut self,
        gray: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Cut the region under `face` out of `gray`.
///
/// Returns `None` when the box does not overlap the image.
pub fn crop(gray: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    let (x, y, w, h) = face.clamp_to(gray.width(), gray.height())?;
    Some(imageops::crop_imm(gray, x, y, w, h).to_image())
}

/// Output positions of the score, box and landmark heads of one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHeads {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Uniform scale plus centering offset that fits a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
    content_w: u32,
    content_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, side: u32) -> Self {
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let content_w = ((width as f32 * scale).round() as u32).clamp(1, side);
        let content_h = ((height as f32 * scale).round() as u32).clamp(1, side);
        Self {
            scale,
            offset_x: (side - content_w) as f32 / 2.0,
            offset_y: (side - content_h) as f32 / 2.0,
            content_w,
            content_h,
        }
    }

    /// Map a point of the model input back into frame coordinates.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x) / self.scale,
            (y - self.offset_y) / self.scale,
        )
    }

    /// NCHW tensor of `gray` scaled into the box; padding normalizes to 0.
    /// The single gray channel is repeated across the three model channels.
    fn tensor(&self, gray: &GrayImage) -> Array4<f32> {
        let resized = imageops::resize(gray, self.content_w, self.content_h, FilterType::Triangle);
        let left = self.offset_x.floor() as u32;
        let top = self.offset_y.floor() as u32;
        let side = INPUT_SIDE as usize;

        Array4::from_shape_fn((1, 3, side, side), |(_, _, y, x)| {
            let (x, y) = (x as u32, y as u32);
            let inside = x >= left
                && y >= top
                && x - left < self.content_w
                && y - top < self.content_h;
            let value = if inside {
                resized.get_pixel(x - left, y - top)[0] as f32
            } else {
                PIXEL_MEAN
            };
            (value - PIXEL_MEAN) * PIXEL_SCALE
        })
    }
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    heads: [StrideHeads; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < STRIDES.len() * 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected score/bbox/kps outputs for 3 strides, model has {}",
                names.len()
            )));
        }

        let heads = locate_heads(&names);
        tracing::info!(path = model_path, ?heads, "SCRFD model loaded");

        Ok(Self { session, heads })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &mut self,
        gray: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if gray.width() == 0 || gray.height() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(gray.width(), gray.height(), INPUT_SIDE);
        let input = letterbox.tensor(gray);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (heads, stride) in self.heads.iter().zip(STRIDES) {
            let extract = |idx: usize, head: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{head} head, stride {stride}: {e}"))
                    })
            };
            let level = StrideLevel {
                stride,
                scores: extract(heads.score, "score")?,
                boxes: extract(heads.bbox, "bbox")?,
                landmarks: extract(heads.kps, "kps")?,
            };
            candidates.extend(level.decode(&letterbox, params.confidence_threshold));
        }

        Ok(select(candidates, params))
    }
}

/// Map output names like `score_8` / `bbox_16` / `kps_32` to positions,
/// or fall back to the export order: scores, then boxes, then landmarks,
/// each for strides 8, 16, 32.
fn locate_heads(names: &[String]) -> [StrideHeads; 3] {
    let position = |head: &str, stride: u32| {
        let wanted = format!("{head}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named = STRIDES.map(|stride| {
        Some(StrideHeads {
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    });

    if let [Some(s8), Some(s16), Some(s32)] = named {
        return [s8, s16, s32];
    }
    tracing::debug!(?names, "unrecognized SCRFD output names, using export order");
    [0, 1, 2].map(|i| StrideHeads {
        score: i,
        bbox: i + 3,
        kps: i + 6,
    })
}

/// Raw head outputs of one feature stride.
struct StrideLevel<'a> {
    stride: u32,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

impl StrideLevel<'_> {
    /// Boxes of every anchor scoring above `threshold`, in frame coordinates.
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let cols = (INPUT_SIDE / self.stride) as usize;
        let anchors = cols * cols * ANCHORS_PER_CELL;
        let step = self.stride as f32;

        self.scores
            .iter()
            .take(anchors)
            .enumerate()
            .filter(|&(_, &score)| score > threshold)
            .filter_map(|(i, &score)| {
                let cell = i / ANCHORS_PER_CELL;
                let cx = (cell % cols) as f32 * step;
                let cy = (cell / cols) as f32 * step;

                let d = self.boxes.get(i * 4..i * 4 + 4)?;
                let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
                let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self
                    .landmarks
                    .get(i * LANDMARK_VALUES..(i + 1) * LANDMARK_VALUES)
                    .map(|k| {
                        std::array::from_fn(|p| {
                            letterbox.to_frame(cx + k[2 * p] * step, cy + k[2 * p + 1] * step)
                        })
                    });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Overlap suppression, then the minimum-size filter. Output stays ordered
/// by confidence.
fn select(candidates: Vec<BoundingBox>, params: &DetectionParams) -> Vec<BoundingBox> {
    let min_side = params.min_face_size as f32;
    suppress_overlaps(candidates, params.nms_threshold)
        .into_iter()
        .filter(|b| b.width >= min_side && b.height >= min_side)
        .collect()
}

/// Greedy NMS: keep the most confident box, drop any later box that
/// overlaps a kept one by more than `max_iou`.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: side,
            height: side,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_overlapping_boxes_are_suppressed() {
        let kept = suppress_overlaps(
            vec![
                scored(5.0, 5.0, 100.0, 0.8),
                scored(200.0, 200.0, 50.0, 0.7),
                scored(0.0, 0.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_select_drops_small_faces() {
        let params = DetectionParams {
            min_face_size: 30,
            ..DetectionParams::RECOGNITION
        };
        let faces = select(
            vec![scored(0.0, 0.0, 20.0, 0.95), scored(100.0, 100.0, 40.0, 0.6)],
            &params,
        );
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].width, 40.0);
    }

    #[test]
    fn test_select_orders_by_confidence() {
        let faces = select(
            vec![scored(0.0, 0.0, 50.0, 0.6), scored(200.0, 0.0, 50.0, 0.9)],
            &DetectionParams::RECOGNITION,
        );
        assert_eq!(faces.len(), 2);
        assert!(faces[0].confidence > faces[1].confidence);
    }

    #[test]
    fn test_letterbox_fit_landscape() {
        let lb = Letterbox::fit(640, 480, INPUT_SIDE);
        assert_eq!((lb.content_w, lb.content_h), (640, 480));
        assert_eq!(lb.offset_y, 80.0);
        assert_eq!(lb.to_frame(320.0, 80.0), (320.0, 0.0));
    }

    #[test]
    fn test_letterbox_tensor_padding_is_zero() {
        let gray = GrayImage::from_pixel(64, 32, image::Luma([255]));
        let lb = Letterbox::fit(64, 32, INPUT_SIDE);
        let t = lb.tensor(&gray);
        assert_eq!(t.shape(), &[1, 3, 640, 640]);
        // Top rows are padding, the middle row is image content.
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        assert!(t[[0, 2, 320, 320]] > 0.9);
    }

    #[test]
    fn test_decode_maps_through_letterbox() {
        // One anchor at grid (0, 0), stride 8, box reaching 2 strides right and down.
        let anchors = 80 * 80 * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[0] = 0.9;
        let mut boxes = vec![0.0f32; anchors * 4];
        boxes[..4].copy_from_slice(&[0.0, 0.0, 2.0, 2.0]);
        let landmarks = vec![0.0f32; anchors * LANDMARK_VALUES];

        let level = StrideLevel {
            stride: 8,
            scores: &scores,
            boxes: &boxes,
            landmarks: &landmarks,
        };
        let letterbox = Letterbox {
            scale: 2.0,
            offset_x: 0.0,
            offset_y: 80.0,
            content_w: 640,
            content_h: 480,
        };
        let faces = level.decode(&letterbox, 0.5);

        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert!((f.x - 0.0).abs() < 1e-4);
        assert!((f.y + 40.0).abs() < 1e-4);
        assert!((f.width - 8.0).abs() < 1e-4);
        assert!((f.height - 8.0).abs() < 1e-4);
        assert_eq!(f.landmarks.map(|l| l[0]), Some((0.0, -40.0)));
    }

    #[test]
    fn test_decode_ignores_low_scores() {
        let anchors = 20 * 20 * ANCHORS_PER_CELL;
        let scores = vec![0.5f32; anchors];
        let boxes = vec![1.0f32; anchors * 4];
        let level = StrideLevel {
            stride: 32,
            scores: &scores,
            boxes: &boxes,
            landmarks: &[],
        };
        let letterbox = Letterbox::fit(640, 640, INPUT_SIDE);
        assert!(level.decode(&letterbox, 0.5).is_empty());
        let faces = level.decode(&letterbox, 0.4);
        assert_eq!(faces.len(), anchors);
        assert!(faces.iter().all(|f| f.landmarks.is_none()));
    }

    #[test]
    fn test_locate_heads_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let heads = locate_heads(&names);
        assert_eq!(heads[0], StrideHeads { score: 2, bbox: 0, kps: 1 });
        assert_eq!(heads[2], StrideHeads { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_locate_heads_export_order() {
        let names: Vec<String> = (0..9).map(|i: usize| format!("out{i}")).collect();
        let heads = locate_heads(&names);
        assert_eq!(heads[1], StrideHeads { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_crop_clips_to_image() {
        let gray = GrayImage::from_fn(20, 10, |x, _| image::Luma([x as u8]));
        let face = BoundingBox {
            x: 15.0,
            y: 2.0,
            width: 10.0,
            height: 5.0,
            confidence: 1.0,
            landmarks: None,
        };
        let region = crop(&gray, &face).unwrap();
        assert_eq!(region.dimensions(), (5, 5));
        assert_eq!(region.get_pixel(0, 0)[0], 15);
    }

    #[test]
    fn test_crop_outside_is_none() {
        let gray = GrayImage::new(10, 10);
        assert!(crop(&gray, &scored(50.0, 50.0, 5.0, 1.0)).is_none());
    }
}
