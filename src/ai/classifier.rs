//! Pose-sequence anomaly classifier.
//!
//! Wraps a normalizing-flow model trained on normal behavior. The model
//! outputs a negative log-likelihood per sequence; we report `score = -nll`,
//! so lower scores mean more anomalous.

use std::path::Path;
use std::sync::Arc;

use ndarray::{Array, IxDyn};
use ort::{Environment, Session};
use serde::{Deserialize, Serialize};

use super::detector::{build_session, run_session};
use super::{PoseFrame, NUM_KEYPOINTS};
use crate::error::Error;

/// Normalization reference resolution, matching the classifier's training
/// preprocessing.
const NORM_RES: [f32; 2] = [856.0, 480.0];

/// The flow operates on 18 keypoints (COCO-17 plus one zero pad).
const MODEL_KEYPOINTS: usize = NUM_KEYPOINTS + 1;

/// Binary classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Normal,
    Abnormal,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Normal => "Normal",
            Classification::Abnormal => "Abnormal",
        }
    }
}

/// Discretized |score| bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceBucket {
    Low,
    Medium,
    High,
}

impl ConfidenceBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBucket::Low => "Low",
            ConfidenceBucket::Medium => "Medium",
            ConfidenceBucket::High => "High",
        }
    }
}

/// Scoring thresholds. `threshold` is the abnormal decision cut; the cuts
/// bucket |score| into LOW/MEDIUM/HIGH.
#[derive(Debug, Clone, Copy)]
pub struct ScoreThresholds {
    pub threshold: f32,
    pub high_cut: f32,
    pub medium_cut: f32,
}

impl ScoreThresholds {
    pub fn classify(&self, score: f32) -> Classification {
        if score < self.threshold {
            Classification::Abnormal
        } else {
            Classification::Normal
        }
    }

    pub fn bucket(&self, score: f32) -> ConfidenceBucket {
        let magnitude = score.abs();
        if magnitude >= self.high_cut {
            ConfidenceBucket::High
        } else if magnitude >= self.medium_cut {
            ConfidenceBucket::Medium
        } else {
            ConfidenceBucket::Low
        }
    }
}

/// Shared anomaly classifier.
pub struct AnomalyClassifier {
    session: Session,
    thresholds: ScoreThresholds,
}

impl AnomalyClassifier {
    pub fn load(
        environment: &Arc<Environment>,
        model_path: &Path,
        device: &str,
        thresholds: ScoreThresholds,
    ) -> Result<Self, Error> {
        let session = build_session(environment, model_path, device)?;
        Ok(Self {
            session,
            thresholds,
        })
    }

    pub fn thresholds(&self) -> ScoreThresholds {
        self.thresholds
    }

    /// Score one complete pose sequence. The caller guarantees the sequence
    /// has exactly the configured length; anything else is a programming
    /// error upstream and is rejected.
    pub fn score(&self, sequence: &[PoseFrame]) -> Result<f32, Error> {
        if sequence.is_empty() {
            return Err(Error::Inference("empty pose sequence".to_string()));
        }

        let input = prepare_input(sequence);
        let output = run_session(&self.session, input)?;
        let nll = output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| Error::Inference("classifier produced empty output".to_string()))?;

        let score = -nll;
        if score.is_nan() {
            // A degenerate (e.g. fully stationary) pose can NaN out of the
            // flow; fall back to the decision boundary instead of alerting.
            return Ok(self.thresholds.threshold);
        }
        Ok(score)
    }
}

/// Convert a `[T]` sequence of 17x3 pose frames into the flow input
/// `[1, 2, T, 18]`: resolution-normalize, zero-mean, std-scale, drop the
/// confidence channel, pad keypoint 18.
fn prepare_input(sequence: &[PoseFrame]) -> Array<f32, IxDyn> {
    let t = sequence.len();

    let mut xs = Vec::with_capacity(t * NUM_KEYPOINTS);
    let mut ys = Vec::with_capacity(t * NUM_KEYPOINTS);
    for frame in sequence {
        for kp in frame.0.iter() {
            xs.push(kp[0] / NORM_RES[0]);
            ys.push(kp[1] / NORM_RES[1]);
        }
    }

    let n = xs.len() as f32;
    let mean_x = xs.iter().sum::<f32>() / n;
    let mean_y = ys.iter().sum::<f32>() / n;
    let var_y = ys.iter().map(|y| (y - mean_y).powi(2)).sum::<f32>() / n;
    let std_y = var_y.sqrt().max(1e-8);

    let mut input = Array::zeros((1, 2, t, MODEL_KEYPOINTS)).into_dyn();
    for (i, (x, y)) in xs.iter().zip(ys.iter()).enumerate() {
        let frame = i / NUM_KEYPOINTS;
        let kp = i % NUM_KEYPOINTS;
        input[[0, 0, frame, kp]] = (x - mean_x) / std_y;
        input[[0, 1, frame, kp]] = (y - mean_y) / std_y;
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ScoreThresholds {
        ScoreThresholds {
            threshold: -2.0,
            high_cut: 3.0,
            medium_cut: 2.0,
        }
    }

    #[test]
    fn lower_scores_are_abnormal() {
        let t = thresholds();
        assert_eq!(t.classify(-3.2), Classification::Abnormal);
        assert_eq!(t.classify(-2.0), Classification::Normal);
        assert_eq!(t.classify(0.5), Classification::Normal);
    }

    #[test]
    fn buckets_follow_magnitude_cuts() {
        let t = thresholds();
        assert_eq!(t.bucket(-3.2), ConfidenceBucket::High);
        assert_eq!(t.bucket(3.0), ConfidenceBucket::High);
        assert_eq!(t.bucket(-2.5), ConfidenceBucket::Medium);
        assert_eq!(t.bucket(-1.9), ConfidenceBucket::Low);
        assert_eq!(t.bucket(0.0), ConfidenceBucket::Low);
    }

    #[test]
    fn prepare_input_shape_and_normalization() {
        let mut frame = PoseFrame::zeroed();
        for (k, kp) in frame.0.iter_mut().enumerate() {
            *kp = [100.0 + k as f32, 200.0 + k as f32, 0.9];
        }
        let sequence = vec![frame; 24];
        let input = prepare_input(&sequence);
        assert_eq!(input.shape(), &[1, 2, 24, 18]);

        // Zero-mean over the x channel of real keypoints.
        let mut sum = 0.0;
        for t in 0..24 {
            for k in 0..NUM_KEYPOINTS {
                sum += input[[0, 0, t, k]];
            }
        }
        assert!(sum.abs() < 1e-3);

        // The padded 18th keypoint stays zero.
        assert_eq!(input[[0, 0, 0, 17]], 0.0);
        assert_eq!(input[[0, 1, 23, 17]], 0.0);
    }
}
