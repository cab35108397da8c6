use crate::error::AppError;
use crate::models::DeviceStatus;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub label: String,
    pub phone_hint: Option<String>,
    pub status: String,
    pub qr: Option<String>,
    pub last_error: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn status(&self) -> Option<DeviceStatus> {
        DeviceStatus::parse(&self.status)
    }
}

#[derive(Clone)]
pub struct DeviceRepository {
    db_pool: PgPool,
}

impl DeviceRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Get device by ID
    pub async fn get(&self, device_id: &Uuid) -> Result<Option<Device>, AppError> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, tenant_id, label, phone_hint, status, qr, last_error,
                   last_seen_at, created_at, updated_at
            FROM devices
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch device: {}", e)))?;

        Ok(device)
    }

    /// Set status plus the QR and error annotations in one statement. Passing
    /// `Some(None)` for an annotation clears it; `None` leaves it untouched.
    pub async fn set_state(
        &self,
        device_id: &Uuid,
        status: DeviceStatus,
        qr: Option<Option<&str>>,
        last_error: Option<Option<&str>>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET
                status = $2,
                qr = CASE WHEN $3 THEN $4 ELSE qr END,
                last_error = CASE WHEN $5 THEN $6 ELSE last_error END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .bind(status.as_str())
        .bind(qr.is_some())
        .bind(qr.flatten())
        .bind(last_error.is_some())
        .bind(last_error.flatten())
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to set device state: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Device not found: {}", device_id)));
        }

        Ok(())
    }

    /// QR pairing code became available.
    pub async fn set_qr(&self, device_id: &Uuid, qr: &str) -> Result<(), AppError> {
        self.set_state(device_id, DeviceStatus::Qr, Some(Some(qr)), Some(None))
            .await
    }

    /// Session opened: ONLINE, QR cleared, error cleared, seen now.
    pub async fn set_online(&self, device_id: &Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET status = 'ONLINE', qr = NULL, last_error = NULL,
                last_seen_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to set device online: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Device not found: {}", device_id)));
        }

        Ok(())
    }

    pub async fn set_offline(&self, device_id: &Uuid) -> Result<(), AppError> {
        self.set_state(device_id, DeviceStatus::Offline, Some(None), None)
            .await
    }

    /// Annotate an unrecoverable local fault.
    pub async fn mark_error(&self, device_id: &Uuid, error: &str) -> Result<(), AppError> {
        self.set_state(device_id, DeviceStatus::Error, None, Some(Some(error)))
            .await
    }

    /// Record the disconnect reason without changing status; the close handler
    /// decides what comes next.
    pub async fn set_last_error(&self, device_id: &Uuid, error: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE devices SET last_error = $2, updated_at = NOW() WHERE id = $1")
            .bind(device_id)
            .bind(error)
            .execute(&self.db_pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to set last_error: {}", e)))?;

        Ok(())
    }

    pub async fn touch_last_seen(&self, device_id: &Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE devices SET last_seen_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(device_id)
            .execute(&self.db_pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to touch last_seen_at: {}", e)))?;

        Ok(())
    }

    /// Devices that have a persisted auth-state blob, for the startup sweep.
    pub async fn list_ids_with_session(&self) -> Result<Vec<Uuid>, AppError> {
        let rows = sqlx::query_as::<_, (Uuid,)>(
            r#"
            SELECT d.id
            FROM devices d
            JOIN wa_sessions s ON s.device_id = d.id
            ORDER BY d.created_at
            "#,
        )
        .fetch_all(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to list devices with sessions: {}", e)))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
