//! SCRFD face detector via ONNX Runtime.
//!
//! Produces the per-frame face boxes that the detection gate consumes.
//! Works on packed RGB frames; landmark outputs, when the model has them,
//! are ignored.

use crate::types::FaceBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> (Self, usize, usize) {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).min(INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as usize).min(INPUT_SIZE);
        let letterbox = Self {
            scale,
            pad_x: (INPUT_SIZE - new_w) as f32 / 2.0,
            pad_y: (INPUT_SIZE - new_h) as f32 / 2.0,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from model input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride: (score, bbox).
type StrideOutputs = (usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load an SCRFD ONNX model (with or without keypoint heads).
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs at least 6 outputs (score/bbox per stride), got {}",
                output_names.len()
            )));
        }
        let stride_outputs = map_outputs(&output_names);

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Detect faces in a packed RGB frame, highest confidence first.
    pub fn detect(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<FaceBox>, DetectorError> {
        let (width, height) = (width as usize, height as usize);
        let expected = width * height * 3;
        if rgb.len() < expected || width == 0 || height == 0 {
            return Err(DetectorError::ShortFrame {
                expected,
                actual: rgb.len(),
            });
        }

        let (input, letterbox) = preprocess(rgb, width, height);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }

        let faces = nms(candidates, NMS_IOU_THRESHOLD);
        tracing::trace!(faces = faces.len(), "detection complete");
        Ok(faces)
    }
}

/// Letterbox the RGB frame into a normalised 1×3×640×640 tensor.
fn preprocess(rgb: &[u8], width: usize, height: usize) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(width, height);
    let off_x = letterbox.pad_x.floor() as usize;
    let off_y = letterbox.pad_y.floor() as usize;

    // Padding stays at the mean, which normalises to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    let inv_scale = 1.0 / letterbox.scale;

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i64).clamp(0, height as i64 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i64).clamp(0, width as i64 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            for c in 0..3 {
                let at = |px: usize, py: usize| rgb[(py * width + px) * 3 + c] as f32;
                let val = at(x0, y0) * (1.0 - fx) * (1.0 - fy)
                    + at(x1, y0) * fx * (1.0 - fy)
                    + at(x0, y1) * (1.0 - fx) * fy
                    + at(x1, y1) * fx * fy;
                tensor[[0, c, y + off_y, x + off_x]] = (val - PIXEL_MEAN) / PIXEL_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Find score/bbox tensors by name ("score_8", "bbox_8", ...), falling back
/// to the usual export order: scores for all strides, then bboxes.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Turn one stride's anchor grid into candidate boxes in frame coordinates.
fn decode_stride(scores: &[f32], bboxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<FaceBox> {
    let grid_w = INPUT_SIZE / stride;
    let grid_h = INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCORE_THRESHOLD {
            continue;
        }
        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let cx = (cell % grid_w) as f32 * step;
        let cy = (cell / grid_w) as f32 * step;

        let top_left = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
        let bottom_right = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);
        out.push(FaceBox {
            top_left,
            bottom_right,
            confidence: score,
        });
    }
    out
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.top_left.0.max(b.top_left.0);
    let y1 = a.top_left.1.max(b.top_left.1);
    let x2 = a.bottom_right.0.min(b.bottom_right.0);
    let y2 = a.bottom_right.1.min(b.bottom_right.1);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> FaceBox {
        FaceBox {
            top_left: (x, y),
            bottom_right: (x + w, y + h),
            confidence,
        }
    }

    #[test]
    fn test_iou() {
        let a = boxed(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!(iou(&a, &boxed(20.0, 20.0, 10.0, 10.0, 1.0)).abs() < 1e-6);
        let half = boxed(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlap_and_sorts() {
        let result = nms(
            vec![
                boxed(200.0, 200.0, 50.0, 50.0, 0.7),
                boxed(0.0, 0.0, 100.0, 100.0, 0.9),
                boxed(5.0, 5.0, 100.0, 100.0, 0.8),
            ],
            NMS_IOU_THRESHOLD,
        );
        let confidences: Vec<f32> = result.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_two_separate_faces_survive_nms() {
        let result = nms(
            vec![boxed(0.0, 0.0, 50.0, 50.0, 0.9), boxed(300.0, 0.0, 50.0, 50.0, 0.85)],
            NMS_IOU_THRESHOLD,
        );
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let (lb, new_w, new_h) = Letterbox::fit(640, 480);
        assert_eq!((new_w, new_h), (640, 480));
        assert_eq!(lb.pad_y, 80.0);

        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 0.1 && (y - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_map_outputs_named_and_positional() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(map_outputs(&named), [(1, 0), (3, 2), (5, 4)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(map_outputs(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_single_anchor() {
        let stride = 32;
        let cells = (INPUT_SIZE / stride) * (INPUT_SIZE / stride) * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut bboxes = vec![0.0f32; cells * 4];
        // Anchor 2 → cell 1 → centre (32, 0); box extends one stride each way.
        scores[2] = 0.95;
        bboxes[8..12].copy_from_slice(&[1.0, 0.0, 1.0, 2.0]);

        let identity = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let faces = decode_stride(&scores, &bboxes, stride, &identity);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].top_left, (0.0, 0.0));
        assert_eq!(faces[0].bottom_right, (64.0, 64.0));
    }

    #[test]
    fn test_preprocess_uniform_mean_is_zero() {
        let rgb = vec![128u8; 64 * 48 * 3];
        let (tensor, _) = preprocess(&rgb, 64, 48);
        assert_eq!(tensor.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        let centre = tensor[[0, 1, INPUT_SIZE / 2, INPUT_SIZE / 2]];
        assert!((centre - (128.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-5);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }
}
