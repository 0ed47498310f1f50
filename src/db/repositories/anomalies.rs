use sqlx::PgExecutor;

use crate::db::models::AnomalyEvent;
use crate::error::Error;

/// Anomalies repository for handling anomaly event persistence
#[derive(Clone)]
pub struct AnomaliesRepository;

impl AnomaliesRepository {
    pub fn new() -> Self {
        Self
    }

    /// Insert a new anomaly event. Takes an executor so the caller can run
    /// it inside a transaction together with the training sample.
    pub async fn create<'e, E>(&self, executor: E, event: &AnomalyEvent) -> Result<(), Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO anomalies (
                id, shop_id, timestamp, location, severity, status, description,
                image_ref, anomaly_type, confidence_score, extra,
                resolved_by, resolved_at, notes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(event.id)
        .bind(event.shop_id)
        .bind(event.timestamp)
        .bind(&event.location)
        .bind(event.severity)
        .bind(event.status)
        .bind(&event.description)
        .bind(&event.image_ref)
        .bind(&event.anomaly_type)
        .bind(event.confidence_score)
        .bind(&event.extra)
        .bind(event.resolved_by)
        .bind(event.resolved_at)
        .bind(&event.notes)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(executor)
        .await
        .map_err(|e| Error::Database(format!("Failed to create anomaly event: {}", e)))?;

        Ok(())
    }

    /// Get an anomaly event by ID
    pub async fn get_by_id<'e, E>(
        &self,
        executor: E,
        id: uuid::Uuid,
    ) -> Result<Option<AnomalyEvent>, Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, AnomalyEvent>(
            r#"
            SELECT id, shop_id, timestamp, location, severity, status, description,
                   image_ref, anomaly_type, confidence_score, extra,
                   resolved_by, resolved_at, notes, created_at, updated_at
            FROM anomalies
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(|e| Error::Database(format!("Failed to get anomaly event: {}", e)))
    }
}

impl Default for AnomaliesRepository {
    fn default() -> Self {
        Self::new()
    }
}
