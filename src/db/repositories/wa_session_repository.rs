use crate::error::AppError;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WaSession {
    pub id: Uuid,
    pub device_id: Uuid,
    pub auth_state_enc: String,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for the encrypted auth-state blob. The plaintext never reaches
/// this layer; callers hand over vault tokens only.
#[derive(Clone)]
pub struct WaSessionRepository {
    db_pool: PgPool,
}

impl WaSessionRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub async fn load(&self, device_id: &Uuid) -> Result<Option<WaSession>, AppError> {
        let session = sqlx::query_as::<_, WaSession>(
            r#"
            SELECT id, device_id, auth_state_enc, updated_at
            FROM wa_sessions
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to load wa_session: {}", e)))?;

        Ok(session)
    }

    pub async fn upsert(&self, device_id: &Uuid, auth_state_enc: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO wa_sessions (device_id, auth_state_enc)
            VALUES ($1, $2)
            ON CONFLICT (device_id) DO UPDATE SET
                auth_state_enc = EXCLUDED.auth_state_enc,
                updated_at = NOW()
            "#,
        )
        .bind(device_id)
        .bind(auth_state_enc)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to upsert wa_session: {}", e)))?;

        Ok(())
    }

    /// Deleting the row forces a fresh pairing on the next connect.
    pub async fn delete(&self, device_id: &Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM wa_sessions WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.db_pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to delete wa_session: {}", e)))?;

        Ok(())
    }
}
