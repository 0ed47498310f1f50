use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::Shop;
use crate::error::Error;
use crate::security::{Claims, UserRole};

/// Shops repository for access checks and alert-target lookup
#[derive(Clone)]
pub struct ShopsRepository {
    pool: Arc<PgPool>,
}

impl ShopsRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Get shop by ID
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Shop>, Error> {
        sqlx::query_as::<_, Shop>(
            r#"
            SELECT id, owner_id, name, telegram_chat_id, created_at
            FROM shops
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get shop: {}", e)))
    }

    /// Whether a user is assigned as manager of a shop
    pub async fn is_manager(&self, shop_id: Uuid, user_id: Uuid) -> Result<bool, Error> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT shop_id FROM shop_managers
            WHERE shop_id = $1 AND manager_id = $2
            "#,
        )
        .bind(shop_id)
        .bind(user_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to check shop manager: {}", e)))?;

        Ok(row.is_some())
    }

    /// Verify the caller may use this shop: OWNER must own it, MANAGER
    /// must be assigned to it. Returns the shop on success.
    pub async fn verify_access(&self, shop_id: Uuid, claims: &Claims) -> Result<Shop, Error> {
        let shop = self
            .get_by_id(shop_id)
            .await?
            .ok_or_else(|| Error::NotFound("shop not found".to_string()))?;

        match claims.role {
            UserRole::Owner => {
                if shop.owner_id != claims.sub {
                    return Err(Error::Forbidden("you do not own this shop".to_string()));
                }
            }
            UserRole::Manager => {
                if !self.is_manager(shop_id, claims.sub).await? {
                    return Err(Error::Forbidden(
                        "you are not assigned to this shop".to_string(),
                    ));
                }
            }
        }

        Ok(shop)
    }
}
