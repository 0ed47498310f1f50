//! YOLO-family person detector over ONNX Runtime.

use std::path::Path;
use std::sync::Arc;

use image::{imageops, RgbImage};
use ndarray::{Array, IxDyn};
use ort::ep::CUDA;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use super::{non_max_suppression, Bbox, Detection};
use crate::error::Error;

/// Square inference input size for the YOLO models.
pub const INF_SIZE: u32 = 640;

/// Gray fill value used when letterboxing, matching training preprocessing.
const PAD_FILL: f32 = 144.0 / 255.0;

/// IoU threshold for post-detection NMS.
const NMS_IOU: f32 = 0.45;

/// COCO class id for `person`.
const PERSON_CLASS: usize = 0;

/// Build an ONNX session for a model artifact, honoring the device tag.
pub(crate) fn build_session(model_path: &Path, device: &str) -> Result<Session, Error> {
    if !model_path.exists() {
        return Err(Error::ModelLoad(format!(
            "model artifact not found: {}",
            model_path.display()
        )));
    }

    let mut builder = Session::builder()
        .map_err(|e| Error::ModelLoad(format!("session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| Error::ModelLoad(format!("session builder: {}", e)))?;

    if device.starts_with("cuda") {
        builder = builder
            .with_execution_providers([CUDA::default().build()])
            .map_err(|e| Error::ModelLoad(format!("cuda provider: {}", e)))?;
    }

    builder
        .commit_from_file(model_path)
        .map_err(|e| Error::ModelLoad(format!("{}: {}", model_path.display(), e)))
}

/// Letterbox an RGB image into a `[1, 3, size, size]` CHW tensor, keeping
/// aspect ratio. Returns the tensor and the scale ratio applied.
pub(crate) fn letterbox(image: &RgbImage, size: u32) -> (Array<f32, IxDyn>, f32) {
    let (w0, h0) = (image.width() as f32, image.height() as f32);
    let ratio = (size as f32 / w0).min(size as f32 / h0);
    let (w_new, h_new) = ((w0 * ratio).round() as u32, (h0 * ratio).round() as u32);

    let resized = imageops::resize(image, w_new.max(1), h_new.max(1), imageops::FilterType::Triangle);

    let mut input = Array::ones((1, 3, size as usize, size as usize)).into_dyn();
    input.fill(PAD_FILL);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        input[[0, 0, y as usize, x as usize]] = r as f32 / 255.0;
        input[[0, 1, y as usize, x as usize]] = g as f32 / 255.0;
        input[[0, 2, y as usize, x as usize]] = b as f32 / 255.0;
    }

    (input, ratio)
}

/// Run a session over a single CHW tensor and return the first output.
pub(crate) fn run_session(session: &Session, input: Array<f32, IxDyn>) -> Result<Array<f32, IxDyn>, Error> {
    let input = CowArray::from(input);
    let value = Value::from_array(session.allocator(), &input)
        .map_err(|e| Error::Inference(format!("input tensor: {}", e)))?;
    let outputs = session
        .run(vec![value])
        .map_err(|e| Error::Inference(format!("session run: {}", e)))?;
    let output = outputs
        .first()
        .ok_or_else(|| Error::Inference("model produced no outputs".to_string()))?;
    let tensor = output
        .try_extract::<f32>()
        .map_err(|e| Error::Inference(format!("output tensor: {}", e)))?;
    Ok(tensor.view().to_owned())
}

/// Shared person detector. The session holds frozen weights; concurrent
/// `detect` calls are safe.
pub struct PersonDetector {
    session: Session,
    conf_threshold: f32,
}

impl PersonDetector {
    pub fn load(
        environment: &Arc<Environment>,
        model_path: &Path,
        device: &str,
        conf_threshold: f32,
    ) -> Result<Self, Error> {
        let session = build_session(environment, model_path, device)?;
        Ok(Self {
            session,
            conf_threshold,
        })
    }

    /// Detect persons in a frame. Output boxes are in frame coordinates;
    /// only class `person` at or above the confidence floor survives.
    pub fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, Error> {
        let (input, ratio) = letterbox(frame, INF_SIZE);
        let output = run_session(&self.session, input)?;
        Ok(self.postprocess(&output, frame.width() as f32, frame.height() as f32, ratio))
    }

    /// Decode `[1, 4 + nc, anchors]` YOLO output into person detections.
    fn postprocess(
        &self,
        output: &Array<f32, IxDyn>,
        frame_w: f32,
        frame_h: f32,
        ratio: f32,
    ) -> Vec<Detection> {
        let shape = output.shape();
        if shape.len() != 3 || shape[1] <= 4 {
            return Vec::new();
        }
        let num_classes = shape[1] - 4;
        let num_anchors = shape[2];

        let mut detections = Vec::new();
        for a in 0..num_anchors {
            let (mut best_class, mut best_conf) = (0usize, f32::MIN);
            for c in 0..num_classes {
                let conf = output[[0, 4 + c, a]];
                if conf > best_conf {
                    best_conf = conf;
                    best_class = c;
                }
            }
            if best_class != PERSON_CLASS || best_conf < self.conf_threshold {
                continue;
            }

            let cx = output[[0, 0, a]] / ratio;
            let cy = output[[0, 1, a]] / ratio;
            let w = output[[0, 2, a]] / ratio;
            let h = output[[0, 3, a]] / ratio;
            let x = (cx - w / 2.0).clamp(0.0, frame_w);
            let y = (cy - h / 2.0).clamp(0.0, frame_h);

            detections.push(Detection {
                bbox: Bbox::new(x, y, w.min(frame_w - x), h.min(frame_h - y)),
                confidence: best_conf,
            });
        }

        non_max_suppression(&mut detections, NMS_IOU);
        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_preserves_aspect_ratio() {
        let image = RgbImage::new(1280, 720);
        let (input, ratio) = letterbox(&image, INF_SIZE);
        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((ratio - 0.5).abs() < 1e-6);
        // Padded rows below the resized content keep the fill value.
        assert!((input[[0, 0, 639, 0]] - PAD_FILL).abs() < 1e-6);
    }

    #[test]
    fn letterbox_scales_down_by_longest_side() {
        let image = RgbImage::new(320, 640);
        let (_, ratio) = letterbox(&image, INF_SIZE);
        assert!((ratio - 1.0).abs() < 1e-6);
    }
}
