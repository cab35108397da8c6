use crate::error::AppError;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub url: String,
    pub secret: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WebhookEndpointRepository {
    db_pool: PgPool,
}

impl WebhookEndpointRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub async fn get(&self, endpoint_id: &Uuid) -> Result<Option<WebhookEndpoint>, AppError> {
        let endpoint = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            SELECT id, tenant_id, url, secret, enabled, created_at
            FROM webhook_endpoints
            WHERE id = $1
            "#,
        )
        .bind(endpoint_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch webhook endpoint: {}", e)))?;

        Ok(endpoint)
    }

    /// Enabled endpoints for the fan-out, inside the caller's transaction so
    /// the enabled-set is read at event-creation time.
    pub async fn list_enabled_for_tenant(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &Uuid,
    ) -> Result<Vec<WebhookEndpoint>, AppError> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            SELECT id, tenant_id, url, secret, enabled, created_at
            FROM webhook_endpoints
            WHERE tenant_id = $1 AND enabled = TRUE
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| AppError::Database(format!("Failed to list enabled endpoints: {}", e)))?;

        Ok(endpoints)
    }
}
