use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ai::ConfidenceBucket;

/// Anomaly lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "anomaly_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Pending,
    Acknowledged,
    Resolved,
    FalsePositive,
}

/// Anomaly severity, derived from the classifier confidence bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "anomaly_severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    /// Map a confidence bucket to a severity. CRITICAL is never produced
    /// here; it requires an explicit escalation flag in `extra`.
    pub fn from_bucket(bucket: ConfidenceBucket) -> Self {
        match bucket {
            ConfidenceBucket::High => AnomalySeverity::High,
            ConfidenceBucket::Medium => AnomalySeverity::Medium,
            ConfidenceBucket::Low => AnomalySeverity::Low,
        }
    }
}

/// Anomaly event model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub severity: AnomalySeverity,
    pub status: AnomalyStatus,
    pub description: String,
    pub image_ref: Option<String>,
    pub anomaly_type: String,
    pub confidence_score: f32,
    pub extra: Option<serde_json::Value>,
    pub resolved_by: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_the_bucket() {
        assert_eq!(
            AnomalySeverity::from_bucket(ConfidenceBucket::High),
            AnomalySeverity::High
        );
        assert_eq!(
            AnomalySeverity::from_bucket(ConfidenceBucket::Medium),
            AnomalySeverity::Medium
        );
        assert_eq!(
            AnomalySeverity::from_bucket(ConfidenceBucket::Low),
            AnomalySeverity::Low
        );
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(AnomalyStatus::FalsePositive).unwrap(),
            "false_positive"
        );
        assert_eq!(serde_json::to_value(AnomalyStatus::Pending).unwrap(), "pending");
    }
}
