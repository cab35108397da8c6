use crate::error::AppError;
use crate::models::OutboundStatus;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub to: String,
    #[sqlx(rename = "type")]
    pub message_type: String,
    pub payload_json: JsonValue,
    pub is_test: bool,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OutboundMessageRepository {
    db_pool: PgPool,
}

impl OutboundMessageRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub async fn create(
        &self,
        tenant_id: &Uuid,
        device_id: &Uuid,
        to: &str,
        message_type: &str,
        payload_json: &JsonValue,
        is_test: bool,
    ) -> Result<OutboundMessage, AppError> {
        let message = sqlx::query_as::<_, OutboundMessage>(
            r#"
            INSERT INTO outbound_messages (tenant_id, device_id, "to", type, payload_json, is_test)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, tenant_id, device_id, "to", type, payload_json, is_test,
                      status, provider_message_id, error, created_at
            "#,
        )
        .bind(tenant_id)
        .bind(device_id)
        .bind(to)
        .bind(message_type)
        .bind(payload_json)
        .bind(is_test)
        .fetch_one(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to create outbound message: {}", e)))?;

        Ok(message)
    }

    pub async fn get(&self, message_id: &Uuid) -> Result<Option<OutboundMessage>, AppError> {
        let message = sqlx::query_as::<_, OutboundMessage>(
            r#"
            SELECT id, tenant_id, device_id, "to", type, payload_json, is_test,
                   status, provider_message_id, error, created_at
            FROM outbound_messages
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch outbound message: {}", e)))?;

        Ok(message)
    }

    pub async fn mark_processing(&self, message_id: &Uuid) -> Result<(), AppError> {
        self.set_status(message_id, OutboundStatus::Processing, None, None)
            .await
    }

    pub async fn mark_sent(
        &self,
        message_id: &Uuid,
        provider_message_id: Option<&str>,
    ) -> Result<(), AppError> {
        self.set_status(message_id, OutboundStatus::Sent, provider_message_id, None)
            .await
    }

    /// Terminal failure. The row never transitions again afterwards.
    pub async fn mark_failed(&self, message_id: &Uuid, error: &str) -> Result<(), AppError> {
        self.set_status(message_id, OutboundStatus::Failed, None, Some(error))
            .await
    }

    async fn set_status(
        &self,
        message_id: &Uuid,
        status: OutboundStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbound_messages
            SET status = $2,
                provider_message_id = COALESCE($3, provider_message_id),
                error = COALESCE($4, error)
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(status.as_str())
        .bind(provider_message_id)
        .bind(error)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to update outbound status: {}", e)))?;

        Ok(())
    }
}
