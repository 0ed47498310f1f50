use serde::{Deserialize, Serialize};

pub mod annotate;
pub mod classifier;
pub mod detector;
pub mod frame_buffer;
pub mod model_manager;
pub mod pose;
pub mod tracker;

pub use classifier::{Classification, ConfidenceBucket};
pub use frame_buffer::FrameBufferManager;
pub use model_manager::ModelManager;
pub use tracker::{PersonTracker, TrackedPerson};

/// Number of COCO keypoints produced by the pose estimator.
pub const NUM_KEYPOINTS: usize = 17;

/// Axis-aligned bounding box, top-left origin, pixel units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Bbox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection over union with another box. Degenerate boxes yield 0.
    pub fn iou(&self, other: &Bbox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

/// One person detection in a frame. Ephemeral.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub bbox: Bbox,
    pub confidence: f32,
}

/// 17 COCO keypoints, each `(x, y, confidence)`, absolute frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame(pub [[f32; 3]; NUM_KEYPOINTS]);

impl PoseFrame {
    pub fn zeroed() -> Self {
        Self([[0.0; 3]; NUM_KEYPOINTS])
    }

    /// Mean keypoint confidence.
    pub fn score(&self) -> f32 {
        self.0.iter().map(|kp| kp[2]).sum::<f32>() / NUM_KEYPOINTS as f32
    }
}

/// Greedy IoU non-maximum suppression over `(bbox, confidence)` candidates,
/// highest confidence first.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections.iter() {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) < iou_threshold) {
            keep.push(*det);
        }
    }
    *detections = keep;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = Bbox::new(10.0, 10.0, 50.0, 100.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0);
        let b = Bbox::new(100.0, 100.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0);
        let b = Bbox::new(5.0, 0.0, 10.0, 10.0);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_highest_confidence_of_a_cluster() {
        let mut dets = vec![
            Detection {
                bbox: Bbox::new(0.0, 0.0, 10.0, 10.0),
                confidence: 0.6,
            },
            Detection {
                bbox: Bbox::new(1.0, 1.0, 10.0, 10.0),
                confidence: 0.9,
            },
            Detection {
                bbox: Bbox::new(100.0, 100.0, 10.0, 10.0),
                confidence: 0.5,
            },
        ];
        non_max_suppression(&mut dets, 0.45);
        assert_eq!(dets.len(), 2);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
    }
}
