use crate::error::AppError;
use crate::models::{LogLevel, ServiceName};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

/// Diagnostic trail. Inserts are best-effort; a failed write must never take
/// the worker down, so callers go through `insert_best_effort`.
#[derive(Clone)]
pub struct LogRepository {
    db_pool: PgPool,
}

impl LogRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub async fn insert(
        &self,
        level: LogLevel,
        service: ServiceName,
        message: &str,
        error: Option<&str>,
        metadata: Option<&JsonValue>,
        tenant_id: Option<&Uuid>,
        device_id: Option<&Uuid>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO logs (level, service, message, error, metadata, tenant_id, device_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(level.as_str())
        .bind(service.as_str())
        .bind(message)
        .bind(error)
        .bind(metadata)
        .bind(tenant_id)
        .bind(device_id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to insert log row: {}", e)))?;

        Ok(())
    }

    pub async fn insert_best_effort(
        &self,
        level: LogLevel,
        message: &str,
        error: Option<&str>,
        metadata: Option<&JsonValue>,
        device_id: Option<&Uuid>,
    ) {
        if let Err(e) = self
            .insert(level, ServiceName::Worker, message, error, metadata, None, device_id)
            .await
        {
            log::debug!("Dropping log row after insert failure: {}", e);
        }
    }
}
