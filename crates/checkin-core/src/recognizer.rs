//! Face descriptor network via ONNX Runtime.
//!
//! Extracts 128-dimensional descriptors from aligned 150×150 RGB crops. The
//! descriptor space is Euclidean; two crops of the same person land within
//! roughly 0.45 of each other.

use crate::alignment;
use crate::backend;
use crate::frame::Frame;
use crate::types::{DescriptorError, DetectionBox, FaceDescriptor, DESCRIPTOR_DIM};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

const DESCRIPTOR_INPUT_SIZE: u32 = 150;
/// Per-channel RGB means of the training set; inputs are scaled by 1/256 after subtraction.
const DESCRIPTOR_MEAN_RGB: [f32; 3] = [122.782, 117.001, 104.298];
const DESCRIPTOR_SCALE: f32 = 256.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model is empty")]
    EmptyModel,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; alignment needs the deep detector's keypoints")]
    NoLandmarks,
    #[error("descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct DescriptorNet {
    session: Session,
}

impl DescriptorNet {
    pub fn load(model: &[u8], label: &str, prefer_accelerated: bool) -> Result<Self, RecognizerError> {
        if model.is_empty() {
            return Err(RecognizerError::EmptyModel);
        }

        let (session, backend) = backend::build_session(model, label, prefer_accelerated)?;

        tracing::info!(
            model = label,
            ?backend,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded descriptor model"
        );

        Ok(Self { session })
    }

    /// Align the face by its landmarks and extract its descriptor.
    pub fn extract(&mut self, frame: &Frame, face: &DetectionBox) -> Result<FaceDescriptor, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;

        let aligned = alignment::align_face(frame.image(), landmarks, DESCRIPTOR_INPUT_SIZE);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        if raw.len() != DESCRIPTOR_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        Ok(FaceDescriptor::new(raw.to_vec())?)
    }
}

/// Aligned RGB crop → mean-subtracted NCHW tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = aligned.width() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, px) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (px[c] as f32 - DESCRIPTOR_MEAN_RGB[c]) / DESCRIPTOR_SCALE;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::new(DESCRIPTOR_INPUT_SIZE, DESCRIPTOR_INPUT_SIZE);
        let tensor = preprocess(&aligned);
        let s = DESCRIPTOR_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, s, s]);
    }

    #[test]
    fn test_preprocess_subtracts_channel_means() {
        let aligned = RgbImage::from_pixel(4, 4, Rgb([200, 100, 50]));
        let tensor = preprocess(&aligned);
        let expected = [
            (200.0 - DESCRIPTOR_MEAN_RGB[0]) / DESCRIPTOR_SCALE,
            (100.0 - DESCRIPTOR_MEAN_RGB[1]) / DESCRIPTOR_SCALE,
            (50.0 - DESCRIPTOR_MEAN_RGB[2]) / DESCRIPTOR_SCALE,
        ];
        for c in 0..3 {
            let got = tensor[[0, c, 2, 3]];
            assert!((got - expected[c]).abs() < 1e-6, "channel {c}: {got} vs {}", expected[c]);
        }
    }

    #[test]
    fn test_missing_landmarks_error_message() {
        let msg = RecognizerError::NoLandmarks.to_string();
        assert!(msg.contains("landmarks"));
    }
}
