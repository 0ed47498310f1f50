//! Anomaly persistence: JPEG evidence to the object store, then the event
//! row and its training sample in one transaction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use log::{error, info, warn};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::ai::annotate::encode_jpeg;
use crate::ai::{ConfidenceBucket, PoseFrame};
use crate::db::models::{AnomalyEvent, AnomalySeverity, AnomalyStatus, TrainingSample};
use crate::db::repositories::{AnomaliesRepository, TrainingDataRepository};
use crate::error::Error;
use crate::messaging::AlertResult;

/// Evidence JPEG quality.
const EVIDENCE_JPEG_QUALITY: u8 = 90;

/// One anomaly to record.
pub struct RecordRequest {
    pub shop_id: Uuid,
    pub stream_id: Uuid,
    pub location: String,
    pub description: String,
    pub anomaly_type: String,
    pub result: AlertResult,
    pub bucket: ConfidenceBucket,
    /// The full buffered pose state at detection time.
    pub pose_dict: HashMap<u32, Vec<PoseFrame>>,
    /// Forward-compatible extras; `{"critical": true}` escalates severity.
    pub extra: serde_json::Value,
}

pub struct AnomalyRecorder {
    pool: Arc<PgPool>,
    anomalies: AnomaliesRepository,
    training_data: TrainingDataRepository,
    frames_dir: PathBuf,
}

impl AnomalyRecorder {
    pub fn new(pool: Arc<PgPool>, frames_dir: PathBuf) -> Self {
        Self {
            pool,
            anomalies: AnomaliesRepository::new(),
            training_data: TrainingDataRepository::new(),
            frames_dir,
        }
    }

    /// Record one anomaly: evidence JPEG first, then event + training
    /// sample in a single transaction. A storage failure aborts; a database
    /// failure is retried once and then surfaced, leaving the evidence
    /// JPEG in place.
    pub async fn record(
        &self,
        request: RecordRequest,
        annotated_frame: &RgbImage,
    ) -> Result<Uuid, Error> {
        let timestamp = Utc::now();
        let relative_path = evidence_path(request.shop_id, timestamp);
        let full_path = self.frames_dir.join(&relative_path);

        let jpeg = encode_jpeg(annotated_frame, EVIDENCE_JPEG_QUALITY)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("create evidence dir: {}", e)))?;
        }
        tokio::fs::write(&full_path, &jpeg)
            .await
            .map_err(|e| Error::Storage(format!("write evidence frame: {}", e)))?;

        let severity = effective_severity(request.bucket, &request.extra);

        let event = AnomalyEvent {
            id: Uuid::new_v4(),
            shop_id: request.shop_id,
            timestamp,
            location: request.location.clone(),
            severity,
            status: AnomalyStatus::Pending,
            description: request.description.clone(),
            image_ref: Some(relative_path.clone()),
            anomaly_type: request.anomaly_type.clone(),
            confidence_score: request.result.score.abs(),
            extra: Some(build_extra(&request)),
            resolved_by: None,
            resolved_at: None,
            notes: None,
            created_at: timestamp,
            updated_at: timestamp,
        };

        let sample = TrainingSample {
            id: Uuid::new_v4(),
            anomaly_id: event.id,
            pose_dict: serde_json::to_value(&request.pose_dict)
                .map_err(|e| Error::Internal(format!("pose dict serialization: {}", e)))?,
            stream_id: request.stream_id,
            frame_number: request.result.frame_number as i64,
            predicted_score: request.result.score,
            predicted_confidence_bucket: request.bucket.as_str().to_string(),
            user_feedback: None,
            user_label: None,
            user_notes: None,
            labeled_by: None,
            labeled_at: None,
            used_for_training: false,
            training_batch_id: None,
            created_at: timestamp,
            updated_at: timestamp,
        };

        // Transient transaction failures get one retry.
        let mut outcome = self.persist(&event, &sample).await;
        if outcome.is_err() {
            outcome = self.persist(&event, &sample).await;
        }

        match outcome {
            Ok(()) => {
                info!(
                    "recorded anomaly {} (shop {}, severity {:?})",
                    event.id, event.shop_id, event.severity
                );
                Ok(event.id)
            }
            Err(e) => {
                error!("anomaly persistence failed after retry: {}", e);
                // The evidence may still matter forensically, so it stays.
                warn!("orphan evidence frame left at {}", full_path.display());
                Err(e)
            }
        }
    }

    async fn persist(&self, event: &AnomalyEvent, sample: &TrainingSample) -> Result<(), Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("begin transaction: {}", e)))?;

        self.anomalies.create(&mut *tx, event).await?;
        self.training_data.create(&mut *tx, sample).await?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("commit transaction: {}", e)))
    }
}

/// Relative evidence path: `{shop_id}/{YYYYMMDD_HHMMSS}_{8hex}.jpg` under
/// the anomaly-frames root.
fn evidence_path(shop_id: Uuid, timestamp: DateTime<Utc>) -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}_{}.jpg",
        shop_id,
        timestamp.format("%Y%m%d_%H%M%S"),
        &short[..8]
    )
}

/// Severity maps straight from the bucket; `extra.critical` is the only
/// escalation path to CRITICAL.
fn effective_severity(bucket: ConfidenceBucket, extra: &serde_json::Value) -> AnomalySeverity {
    if extra.get("critical").and_then(|v| v.as_bool()) == Some(true) {
        return AnomalySeverity::Critical;
    }
    AnomalySeverity::from_bucket(bucket)
}

fn build_extra(request: &RecordRequest) -> serde_json::Value {
    let mut extra = json!({
        "person_id": request.result.person_id,
        "bbox": request.result.bbox,
        "frame_number": request.result.frame_number,
        "score": request.result.score,
        "classification": request.result.classification,
        "stream_id": request.stream_id,
    });
    // Caller-provided extras win on key collisions.
    if let (Some(base), Some(provided)) = (extra.as_object_mut(), request.extra.as_object()) {
        for (key, value) in provided {
            base.insert(key.clone(), value.clone());
        }
    }
    extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Bbox, Classification};

    fn request(extra: serde_json::Value) -> RecordRequest {
        let mut pose_dict = HashMap::new();
        pose_dict.insert(1u32, vec![PoseFrame::zeroed(); 24]);
        RecordRequest {
            shop_id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            location: "Entrance".to_string(),
            description: "Anomalous behavior detected".to_string(),
            anomaly_type: "suspicious_behavior".to_string(),
            result: AlertResult::new(
                1,
                24,
                -3.2,
                Classification::Abnormal,
                ConfidenceBucket::High,
                Bbox::new(10.0, 20.0, 30.0, 40.0),
            ),
            bucket: ConfidenceBucket::High,
            pose_dict,
            extra,
        }
    }

    #[test]
    fn evidence_path_shape() {
        let shop = Uuid::new_v4();
        let ts = DateTime::parse_from_rfc3339("2026-03-01T12:34:56Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = evidence_path(shop, ts);
        assert!(path.starts_with(&format!("{}/20260301_123456_", shop)));
        assert!(path.ends_with(".jpg"));
        let filename = path.rsplit('/').next().unwrap();
        assert_eq!(filename.len(), "20260301_123456_".len() + 8 + 4);
    }

    #[test]
    fn severity_escalates_only_on_explicit_flag() {
        assert_eq!(
            effective_severity(ConfidenceBucket::High, &json!({})),
            AnomalySeverity::High
        );
        assert_eq!(
            effective_severity(ConfidenceBucket::Low, &json!({"critical": false})),
            AnomalySeverity::Low
        );
        assert_eq!(
            effective_severity(ConfidenceBucket::Medium, &json!({"critical": true})),
            AnomalySeverity::Critical
        );
    }

    #[test]
    fn extra_payload_carries_detection_fields() {
        let req = request(json!({"critical": true}));
        let extra = build_extra(&req);
        assert_eq!(extra["person_id"], 1);
        assert_eq!(extra["frame_number"], 24);
        assert_eq!(extra["bbox"]["x"], 10);
        assert_eq!(extra["critical"], true);
        assert_eq!(extra["stream_id"], json!(req.stream_id));
    }

    #[test]
    fn pose_dict_serializes_with_full_shape() {
        let req = request(json!({}));
        let value = serde_json::to_value(&req.pose_dict).unwrap();
        let person = &value["1"];
        assert_eq!(person.as_array().unwrap().len(), 24);
        assert_eq!(person[0].as_array().unwrap().len(), 17);
        assert_eq!(person[0][0].as_array().unwrap().len(), 3);
    }
}
