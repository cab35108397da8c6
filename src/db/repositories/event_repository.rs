use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    #[sqlx(rename = "type")]
    pub event_type: String,
    pub normalized_json: JsonValue,
    pub raw_json: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Append-only inbound record. Rows are immutable once written.
#[derive(Clone)]
pub struct EventRepository {
    db_pool: PgPool,
}

impl EventRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Insert inside the caller's transaction so the event and its delivery
    /// fan-out commit together.
    pub async fn insert(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: &Uuid,
        device_id: &Uuid,
        event_type: &str,
        normalized_json: &JsonValue,
        raw_json: &JsonValue,
    ) -> Result<Event, AppError> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events (tenant_id, device_id, type, normalized_json, raw_json)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, tenant_id, device_id, type, normalized_json, raw_json, created_at
            "#,
        )
        .bind(tenant_id)
        .bind(device_id)
        .bind(event_type)
        .bind(normalized_json)
        .bind(raw_json)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::Database(format!("Failed to insert event: {}", e)))?;

        Ok(event)
    }

    pub async fn get(&self, event_id: &Uuid) -> Result<Option<Event>, AppError> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            SELECT id, tenant_id, device_id, type, normalized_json, raw_json, created_at
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch event: {}", e)))?;

        Ok(event)
    }

    /// Transport `getMessage` lookup: the most recent raw envelope observed
    /// for a (message id, chat id) pair on this device.
    pub async fn find_raw_message(
        &self,
        device_id: &Uuid,
        message_id: &str,
        remote_jid: &str,
    ) -> Result<Option<JsonValue>, AppError> {
        let row = sqlx::query_as::<_, (JsonValue,)>(
            r#"
            SELECT raw_json
            FROM events
            WHERE device_id = $1
              AND raw_json->'key'->>'id' = $2
              AND raw_json->'key'->>'remoteJid' = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(message_id)
        .bind(remote_jid)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to look up raw message: {}", e)))?;

        Ok(row.map(|(raw,)| raw))
    }
}
