use sqlx::PgExecutor;

use crate::db::models::TrainingSample;
use crate::error::Error;

/// Training-data repository for the supervised-retraining corpus
#[derive(Clone)]
pub struct TrainingDataRepository;

impl TrainingDataRepository {
    pub fn new() -> Self {
        Self
    }

    /// Insert a new training sample. Takes an executor so the caller can
    /// run it in the same transaction as its anomaly event.
    pub async fn create<'e, E>(&self, executor: E, sample: &TrainingSample) -> Result<(), Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO anomaly_training_data (
                id, anomaly_id, pose_dict, stream_id, frame_number,
                predicted_score, predicted_confidence_bucket,
                user_feedback, user_label, user_notes, labeled_by, labeled_at,
                used_for_training, training_batch_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(sample.id)
        .bind(sample.anomaly_id)
        .bind(&sample.pose_dict)
        .bind(sample.stream_id)
        .bind(sample.frame_number)
        .bind(sample.predicted_score)
        .bind(&sample.predicted_confidence_bucket)
        .bind(sample.user_feedback)
        .bind(&sample.user_label)
        .bind(&sample.user_notes)
        .bind(sample.labeled_by)
        .bind(sample.labeled_at)
        .bind(sample.used_for_training)
        .bind(&sample.training_batch_id)
        .bind(sample.created_at)
        .bind(sample.updated_at)
        .execute(executor)
        .await
        .map_err(|e| Error::Database(format!("Failed to create training sample: {}", e)))?;

        Ok(())
    }
}

impl Default for TrainingDataRepository {
    fn default() -> Self {
        Self::new()
    }
}
