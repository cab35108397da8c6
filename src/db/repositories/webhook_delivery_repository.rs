use crate::error::AppError;
use crate::models::DeliveryStatus;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A delivery joined with everything the dispatcher needs to post it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryWithTarget {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub endpoint_url: String,
    pub endpoint_secret: String,
    pub endpoint_enabled: bool,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub event_type: String,
    pub normalized_json: serde_json::Value,
    pub raw_json: serde_json::Value,
    pub event_created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WebhookDeliveryRepository {
    db_pool: PgPool,
}

impl WebhookDeliveryRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Create a PENDING delivery row inside the fan-out transaction.
    pub async fn insert(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        endpoint_id: &Uuid,
        event_id: &Uuid,
    ) -> Result<WebhookDelivery, AppError> {
        let delivery = sqlx::query_as::<_, WebhookDelivery>(
            r#"
            INSERT INTO webhook_deliveries (endpoint_id, event_id, status, attempts)
            VALUES ($1, $2, 'PENDING', 0)
            RETURNING id, endpoint_id, event_id, status, attempts, last_error,
                      next_retry_at, created_at
            "#,
        )
        .bind(endpoint_id)
        .bind(event_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::Database(format!("Failed to insert webhook delivery: {}", e)))?;

        Ok(delivery)
    }

    pub async fn get(&self, delivery_id: &Uuid) -> Result<Option<WebhookDelivery>, AppError> {
        let delivery = sqlx::query_as::<_, WebhookDelivery>(
            r#"
            SELECT id, endpoint_id, event_id, status, attempts, last_error,
                   next_retry_at, created_at
            FROM webhook_deliveries
            WHERE id = $1
            "#,
        )
        .bind(delivery_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch webhook delivery: {}", e)))?;

        Ok(delivery)
    }

    /// Joined load for the dispatcher: delivery + endpoint + event in one trip.
    pub async fn get_with_target(
        &self,
        delivery_id: &Uuid,
    ) -> Result<Option<DeliveryWithTarget>, AppError> {
        let row = sqlx::query_as::<_, DeliveryWithTarget>(
            r#"
            SELECT
                d.id, d.endpoint_id, d.event_id, d.status, d.attempts,
                w.url AS endpoint_url,
                w.secret AS endpoint_secret,
                w.enabled AS endpoint_enabled,
                e.tenant_id, e.device_id,
                e.type AS event_type,
                e.normalized_json, e.raw_json,
                e.created_at AS event_created_at
            FROM webhook_deliveries d
            JOIN webhook_endpoints w ON w.id = d.endpoint_id
            JOIN events e ON e.id = d.event_id
            WHERE d.id = $1
            "#,
        )
        .bind(delivery_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to load delivery with target: {}", e)))?;

        Ok(row)
    }

    /// PENDING rows older than the cutoff. A row only lingers in PENDING when
    /// its post-commit enqueue failed, so these have no job left anywhere and
    /// must be re-enqueued by the recovery loop.
    pub async fn list_stale_pending(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> Result<Vec<Uuid>, AppError> {
        let cutoff = Utc::now() - older_than;

        let rows = sqlx::query_as::<_, (Uuid,)>(
            r#"
            SELECT id
            FROM webhook_deliveries
            WHERE status = 'PENDING' AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to list stale deliveries: {}", e)))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn mark_success(&self, delivery_id: &Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'SUCCESS', attempts = attempts + 1,
                last_error = NULL, next_retry_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(delivery_id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to mark delivery success: {}", e)))?;

        Ok(())
    }

    /// Record a failed attempt that will be retried at `now + retry_in`.
    pub async fn mark_failed_retrying(
        &self,
        delivery_id: &Uuid,
        attempts: i32,
        last_error: &str,
        retry_in: Duration,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = $2, attempts = $3, last_error = $4, next_retry_at = $5
            WHERE id = $1
            "#,
        )
        .bind(delivery_id)
        .bind(DeliveryStatus::Failed.as_str())
        .bind(attempts)
        .bind(last_error)
        .bind(Utc::now() + retry_in)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to mark delivery failed: {}", e)))?;

        Ok(())
    }

    /// Terminal dead-letter transition after the last attempt.
    pub async fn mark_dlq(
        &self,
        delivery_id: &Uuid,
        attempts: i32,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'DLQ', attempts = $2, last_error = $3, next_retry_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(delivery_id)
        .bind(attempts)
        .bind(last_error)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to mark delivery DLQ: {}", e)))?;

        Ok(())
    }
}
