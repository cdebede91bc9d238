//! SCRFD face detector via ONNX Runtime.
//!
//! Both engines use this decoder: the fast engine runs a light SCRFD export at
//! 320×320, the deep engine a heavier one at 640×640 whose keypoint head feeds
//! alignment. 3-stride anchor-free decoding with NMS post-processing.

use crate::backend;
use crate::frame::Frame;
use crate::types::DetectionBox;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

pub const FAST_INPUT_SIZE: usize = 320;
pub const DEEP_INPUT_SIZE: usize = 640;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model is empty")]
    EmptyModel,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied by the letterbox, for mapping back to the frame.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// (score, bbox, kps) output positions for one stride.
type StrideOutputIndices = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    input_size: usize,
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load an SCRFD model from bundle bytes.
    pub fn load(
        model: &[u8],
        label: &str,
        input_size: usize,
        prefer_accelerated: bool,
    ) -> Result<Self, DetectorError> {
        if model.is_empty() {
            return Err(DetectorError::EmptyModel);
        }

        let (session, backend) = backend::build_session(model, label, prefer_accelerated)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            model = label,
            input_size,
            ?backend,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "{label}: expected 9 SCRFD outputs, model has {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(model = label, ?stride_indices, "SCRFD output mapping");

        Ok(Self {
            session,
            input_size,
            stride_indices,
        })
    }

    /// Detect faces, sorted by descending confidence.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(frame, self.input_size);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(&self.stride_indices) {
            let head = StrideHead {
                stride,
                scores: tensor_data(&outputs[score_idx], "score", stride)?,
                bboxes: tensor_data(&outputs[bbox_idx], "bbox", stride)?,
                kps: tensor_data(&outputs[kps_idx], "kps", stride)?,
            };
            candidates.extend(head.decode(self.input_size, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        // nms keeps descending-confidence order.
        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detect");
        Ok(faces)
    }
}

/// Letterbox an RGB frame into a square NCHW float tensor.
fn preprocess(frame: &Frame, input_size: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (frame.width() as f32, frame.height() as f32);
    let scale = (input_size as f32 / width).min(input_size as f32 / height);

    let new_w = ((width * scale).round() as u32).clamp(1, input_size as u32);
    let new_h = ((height * scale).round() as u32).clamp(1, input_size as u32);
    let pad_x = (input_size as u32 - new_w) as f32 / 2.0;
    let pad_y = (input_size as u32 - new_h) as f32 / 2.0;

    let resized = imageops::resize(frame.image(), new_w, new_h, FilterType::Triangle);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    // Padding stays at 0.0, i.e. SCRFD_MEAN after normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    for (x, y, px) in resized.enumerate_pixels() {
        let tx = x as usize + pad_x_start;
        let ty = y as usize + pad_y_start;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Map each stride to its (score, bbox, kps) output.
///
/// Exports that name heads `score_8`, `bbox_16`, ... are matched by name in
/// any order. Otherwise outputs are assumed grouped by head: three scores,
/// then three bboxes, then three keypoint tensors.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let position = |head: &str, stride: usize| names.iter().position(|n| *n == format!("{head}_{stride}"));
    let by_name = SCRFD_STRIDES.map(|stride| {
        Some((position("score", stride)?, position("bbox", stride)?, position("kps", stride)?))
    });

    match by_name {
        [Some(s8), Some(s16), Some(s32)] => [s8, s16, s32],
        _ => {
            tracing::debug!(?names, "SCRFD: unnamed outputs, assuming grouped head order");
            std::array::from_fn(|i| (i, i + 3, i + 6))
        }
    }
}

fn tensor_data<'v>(value: &'v ort::value::DynValue, head: &str, stride: usize) -> Result<&'v [f32], DetectorError> {
    value
        .try_extract_tensor::<f32>()
        .map(|(_, data)| data)
        .map_err(|e| DetectorError::InferenceFailed(format!("{head} stride {stride}: {e}")))
}

/// Raw outputs of one stride level.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHead<'_> {
    /// Anchor-free decode: distances from each anchor center, scaled by stride,
    /// mapped back through the letterbox into frame pixels.
    fn decode(&self, input_size: usize, letterbox: &LetterboxInfo, threshold: f32) -> Vec<DetectionBox> {
        let grid = input_size / self.stride;
        let step = self.stride as f32;
        let to_frame = |x: f32, y: f32| ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale);

        let anchors = (grid * grid * SCRFD_ANCHORS_PER_CELL).min(self.scores.len());
        (0..anchors)
            .filter(|&a| self.scores[a] > threshold)
            .filter_map(|a| {
                let cell = a / SCRFD_ANCHORS_PER_CELL;
                let (cx, cy) = ((cell % grid) as f32 * step, (cell / grid) as f32 * step);

                let d = self.bboxes.get(a * 4..a * 4 + 4)?;
                let (left, top) = to_frame(cx - d[0] * step, cy - d[1] * step);
                let (right, bottom) = to_frame(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self.kps.get(a * 10..a * 10 + 10).map(|k| {
                    std::array::from_fn(|p| to_frame(cx + k[p * 2] * step, cy + k[p * 2 + 1] * step))
                });

                Some(DetectionBox {
                    x: left,
                    y: top,
                    width: right - left,
                    height: bottom - top,
                    confidence: self.scores[a],
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy NMS; returns survivors by descending confidence.
fn nms(mut candidates: Vec<DetectionBox>, iou_threshold: f32) -> Vec<DetectionBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<DetectionBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !kept.iter().any(|k| iou(k, &candidate) > iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &DetectionBox, b: &DetectionBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let shared = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - shared;
    if union <= 0.0 {
        0.0
    } else {
        shared / union
    }
}
