use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shop model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Shop {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    /// Optional external alert target (Telegram chat id)
    pub telegram_chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
