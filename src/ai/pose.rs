//! YOLO pose estimation over bbox crops.

use std::path::Path;
use std::sync::Arc;

use image::{imageops, RgbImage};
use ndarray::{Array, IxDyn};
use ort::{Environment, Session};

use super::detector::{build_session, letterbox, run_session, INF_SIZE};
use super::{Bbox, PoseFrame, NUM_KEYPOINTS};
use crate::error::Error;

/// Fraction of the bbox size used as crop padding on each side.
const CROP_PADDING: f32 = 0.01;

/// Keypoints below this confidence are zeroed rather than trusted.
const KEYPOINT_CONF: f32 = 0.05;

/// Pose estimator configuration handed out by the model manager.
#[derive(Debug, Clone)]
pub struct PoseConfig {
    pub model_path: std::path::PathBuf,
    pub sequence_length: usize,
    pub device: String,
}

/// Shared pose estimator. Stateless between calls.
pub struct PoseEstimator {
    session: Session,
}

impl PoseEstimator {
    pub fn load(
        environment: &Arc<Environment>,
        model_path: &Path,
        device: &str,
    ) -> Result<Self, Error> {
        let session = build_session(environment, model_path, device)?;
        Ok(Self { session })
    }

    /// Estimate the 17 COCO keypoints for the person inside `bbox`.
    ///
    /// The crop gets a small padding margin; the best-scoring instance in
    /// the crop wins. Keypoints come back in absolute frame coordinates.
    /// A crop with no detectable person yields an all-zero pose, so the
    /// sequence keeps its cadence even through occlusions.
    pub fn keypoints(&self, frame: &RgbImage, bbox: &Bbox) -> Result<PoseFrame, Error> {
        let (crop, off_x, off_y) = crop_with_padding(frame, bbox);
        if crop.width() == 0 || crop.height() == 0 {
            return Ok(PoseFrame::zeroed());
        }

        let (input, ratio) = letterbox(&crop, INF_SIZE);
        let output = run_session(&self.session, input)?;

        Ok(best_instance(&output, ratio)
            .map(|kps| to_frame_coords(kps, off_x, off_y))
            .unwrap_or_else(PoseFrame::zeroed))
    }
}

fn crop_with_padding(frame: &RgbImage, bbox: &Bbox) -> (RgbImage, f32, f32) {
    let (fw, fh) = (frame.width() as f32, frame.height() as f32);
    let pad_x = bbox.w * CROP_PADDING;
    let pad_y = bbox.h * CROP_PADDING;

    let x1 = (bbox.x - pad_x).max(0.0);
    let y1 = (bbox.y - pad_y).max(0.0);
    let x2 = (bbox.x + bbox.w + pad_x).min(fw);
    let y2 = (bbox.y + bbox.h + pad_y).min(fh);

    let w = (x2 - x1).max(0.0) as u32;
    let h = (y2 - y1).max(0.0) as u32;
    let crop = imageops::crop_imm(frame, x1 as u32, y1 as u32, w.max(1), h.max(1)).to_image();
    (crop, x1, y1)
}

/// Decode `[1, 56, anchors]` pose output (4 bbox + 1 conf + 17x3 keypoints)
/// and pick the highest-confidence instance, in crop coordinates.
fn best_instance(output: &Array<f32, IxDyn>, ratio: f32) -> Option<[[f32; 3]; NUM_KEYPOINTS]> {
    let shape = output.shape();
    if shape.len() != 3 || shape[1] < 5 + NUM_KEYPOINTS * 3 {
        return None;
    }
    let num_anchors = shape[2];

    let mut best: Option<(f32, usize)> = None;
    for a in 0..num_anchors {
        let conf = output[[0, 4, a]];
        if best.map_or(true, |(c, _)| conf > c) {
            best = Some((conf, a));
        }
    }
    let (conf, anchor) = best?;
    if conf < KEYPOINT_CONF {
        return None;
    }

    let mut keypoints = [[0.0f32; 3]; NUM_KEYPOINTS];
    for (k, kp) in keypoints.iter_mut().enumerate() {
        let kx = output[[0, 5 + k * 3, anchor]] / ratio;
        let ky = output[[0, 5 + k * 3 + 1, anchor]] / ratio;
        let kconf = output[[0, 5 + k * 3 + 2, anchor]];
        if kconf >= KEYPOINT_CONF {
            *kp = [kx, ky, kconf];
        }
    }
    Some(keypoints)
}

fn to_frame_coords(mut kps: [[f32; 3]; NUM_KEYPOINTS], off_x: f32, off_y: f32) -> PoseFrame {
    for kp in kps.iter_mut() {
        if kp[2] > 0.0 {
            kp[0] += off_x;
            kp[1] += off_y;
        }
    }
    PoseFrame(kps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_is_clamped_to_frame_bounds() {
        let frame = RgbImage::new(100, 100);
        let bbox = Bbox::new(90.0, 90.0, 50.0, 50.0);
        let (crop, off_x, off_y) = crop_with_padding(&frame, &bbox);
        assert!(off_x >= 89.0 && off_y >= 89.0);
        assert!(crop.width() <= 11 && crop.height() <= 11);
    }

    #[test]
    fn keypoint_offsets_skip_missing_points() {
        let mut kps = [[0.0f32; 3]; NUM_KEYPOINTS];
        kps[0] = [10.0, 20.0, 0.9];
        let pose = to_frame_coords(kps, 5.0, 7.0);
        assert_eq!(pose.0[0], [15.0, 27.0, 0.9]);
        // Undetected keypoints stay at the origin instead of drifting by
        // the crop offset.
        assert_eq!(pose.0[1], [0.0, 0.0, 0.0]);
    }
}
