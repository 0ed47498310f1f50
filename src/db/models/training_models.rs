use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User verdict on a recorded detection, set during labeling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_feedback", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserFeedback {
    TruePositive,
    FalsePositive,
    Uncertain,
}

/// Training sample model. Created 1:1 with its anomaly event, in the same
/// transaction; the pose tensor is kept verbatim for supervised retraining.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrainingSample {
    pub id: Uuid,
    pub anomaly_id: Uuid,
    /// The exact `{person_id -> N x 17 x 3}` tensor fed to the classifier.
    pub pose_dict: serde_json::Value,
    pub stream_id: Uuid,
    pub frame_number: i64,
    pub predicted_score: f32,
    pub predicted_confidence_bucket: String,
    pub user_feedback: Option<UserFeedback>,
    pub user_label: Option<String>,
    pub user_notes: Option<String>,
    pub labeled_by: Option<Uuid>,
    pub labeled_at: Option<DateTime<Utc>>,
    pub used_for_training: bool,
    pub training_batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
