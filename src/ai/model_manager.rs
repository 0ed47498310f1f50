//! Process-wide owner of the heavy AI models.
//!
//! All streams share one detector, one pose estimator, and one classifier.
//! Inference runs on a bounded blocking pool so the scheduler loop never
//! stalls on a forward pass; pre/postprocessing is not serialized.

use std::sync::{Arc, RwLock};

use image::RgbImage;
use ort::Environment;
use tokio::sync::Semaphore;

use super::classifier::{AnomalyClassifier, ScoreThresholds};
use super::detector::PersonDetector;
use super::pose::{PoseConfig, PoseEstimator};
use super::{Bbox, Detection, PoseFrame};
use crate::config::{DetectionConfig, ModelConfig};
use crate::error::Error;

/// The loaded model set. Read-only after load.
pub struct Models {
    pub detector: PersonDetector,
    pub pose: PoseEstimator,
    pub classifier: AnomalyClassifier,
}

pub struct ModelManager {
    model_config: ModelConfig,
    detection_config: DetectionConfig,
    models: RwLock<Option<Arc<Models>>>,
    inference_permits: Arc<Semaphore>,
}

impl ModelManager {
    pub fn new(model_config: ModelConfig, detection_config: DetectionConfig) -> Self {
        let workers = model_config.inference_workers.max(1);
        Self {
            model_config,
            detection_config,
            models: RwLock::new(None),
            inference_permits: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Load every model artifact. Idempotent: a second call is a no-op.
    pub fn load(&self) -> Result<(), Error> {
        {
            let loaded = self.models.read().expect("model lock poisoned");
            if loaded.is_some() {
                log::info!("models already loaded");
                return Ok(());
            }
        }

        // Fail on missing artifacts before touching the runtime.
        for path in [
            &self.model_config.yolo_model_path,
            &self.model_config.pose_model_path,
            &self.model_config.anomaly_model_path,
        ] {
            if !path.exists() {
                return Err(Error::ModelLoad(format!(
                    "model artifact not found: {}",
                    path.display()
                )));
            }
        }

        log::info!(
            "loading models (device: {}, workers: {})",
            self.model_config.device,
            self.model_config.inference_workers
        );

        let environment = Arc::new(
            Environment::builder()
                .with_name("shopguard")
                .build()
                .map_err(|e| Error::ModelLoad(format!("onnxruntime environment: {}", e)))?,
        );

        let detector = PersonDetector::load(
            &environment,
            &self.model_config.yolo_model_path,
            &self.model_config.device,
            self.detection_config.person_confidence,
        )?;
        log::info!(
            "person detector loaded: {}",
            self.model_config.yolo_model_path.display()
        );

        let pose = PoseEstimator::load(
            &environment,
            &self.model_config.pose_model_path,
            &self.model_config.device,
        )?;
        log::info!(
            "pose estimator loaded: {}",
            self.model_config.pose_model_path.display()
        );

        let classifier = AnomalyClassifier::load(
            &environment,
            &self.model_config.anomaly_model_path,
            &self.model_config.device,
            ScoreThresholds {
                threshold: self.detection_config.anomaly_threshold,
                high_cut: self.detection_config.high_cut,
                medium_cut: self.detection_config.medium_cut,
            },
        )?;
        log::info!(
            "anomaly classifier loaded: {} (threshold: {})",
            self.model_config.anomaly_model_path.display(),
            self.detection_config.anomaly_threshold
        );

        *self.models.write().expect("model lock poisoned") = Some(Arc::new(Models {
            detector,
            pose,
            classifier,
        }));
        Ok(())
    }

    /// Release model resources.
    pub fn cleanup(&self) {
        if self
            .models
            .write()
            .expect("model lock poisoned")
            .take()
            .is_some()
        {
            log::info!("models released");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.models.read().expect("model lock poisoned").is_some()
    }

    /// The shared model set. Callers must not mutate model state; inference
    /// entry points below dispatch onto the bounded blocking pool.
    pub fn models(&self) -> Result<Arc<Models>, Error> {
        self.models
            .read()
            .expect("model lock poisoned")
            .clone()
            .ok_or_else(|| Error::ModelLoad("models not loaded".to_string()))
    }

    /// Pose-estimation configuration for per-stream components.
    pub fn pose_config(&self) -> PoseConfig {
        PoseConfig {
            model_path: self.model_config.pose_model_path.clone(),
            sequence_length: self.detection_config.sequence_length,
            device: self.model_config.device.clone(),
        }
    }

    pub fn thresholds(&self) -> ScoreThresholds {
        ScoreThresholds {
            threshold: self.detection_config.anomaly_threshold,
            high_cut: self.detection_config.high_cut,
            medium_cut: self.detection_config.medium_cut,
        }
    }

    pub fn sequence_length(&self) -> usize {
        self.detection_config.sequence_length
    }

    /// Detect persons in a frame on the inference pool.
    pub async fn detect(&self, frame: Arc<RgbImage>) -> Result<Vec<Detection>, Error> {
        let models = self.models()?;
        let _permit = self
            .inference_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("inference pool closed".to_string()))?;
        tokio::task::spawn_blocking(move || models.detector.detect(&frame))
            .await
            .map_err(|e| Error::Inference(format!("detector task: {}", e)))?
    }

    /// Estimate keypoints for one tracked bbox on the inference pool.
    pub async fn pose_keypoints(
        &self,
        frame: Arc<RgbImage>,
        bbox: Bbox,
    ) -> Result<PoseFrame, Error> {
        let models = self.models()?;
        let _permit = self
            .inference_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("inference pool closed".to_string()))?;
        tokio::task::spawn_blocking(move || models.pose.keypoints(&frame, &bbox))
            .await
            .map_err(|e| Error::Inference(format!("pose task: {}", e)))?
    }

    /// Score a complete pose sequence on the inference pool.
    pub async fn score_sequence(&self, sequence: Vec<PoseFrame>) -> Result<f32, Error> {
        let models = self.models()?;
        let _permit = self
            .inference_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("inference pool closed".to_string()))?;
        tokio::task::spawn_blocking(move || models.classifier.score(&sequence))
            .await
            .map_err(|e| Error::Inference(format!("classifier task: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn manager() -> ModelManager {
        ModelManager::new(
            ModelConfig {
                yolo_model_path: PathBuf::from("/nonexistent/detect.onnx"),
                pose_model_path: PathBuf::from("/nonexistent/pose.onnx"),
                anomaly_model_path: PathBuf::from("/nonexistent/flow.onnx"),
                device: "cpu".into(),
                inference_workers: 2,
            },
            DetectionConfig {
                person_confidence: 0.45,
                anomaly_threshold: 0.0,
                high_cut: 3.0,
                medium_cut: 2.0,
                sequence_length: 24,
                tracker_max_age: 30,
                tracker_iou_threshold: 0.3,
            },
        )
    }

    #[test]
    fn load_fails_on_missing_artifacts() {
        let mgr = manager();
        let err = mgr.load().expect_err("missing artifacts must fail");
        assert!(matches!(err, Error::ModelLoad(_)));
        assert!(!mgr.is_loaded());
    }

    #[tokio::test]
    async fn inference_before_load_is_rejected() {
        let mgr = manager();
        let err = mgr
            .score_sequence(vec![PoseFrame::zeroed(); 24])
            .await
            .expect_err("unloaded manager must reject inference");
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn pose_config_carries_sequence_length() {
        let cfg = manager().pose_config();
        assert_eq!(cfg.sequence_length, 24);
        assert_eq!(cfg.device, "cpu");
    }
}
