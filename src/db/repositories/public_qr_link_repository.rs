use crate::error::AppError;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PublicQrLink {
    pub id: Uuid,
    pub device_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PublicQrLink {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

#[derive(Clone)]
pub struct PublicQrLinkRepository {
    db_pool: PgPool,
}

impl PublicQrLinkRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Create a one-time exposure link. Token is 32 random bytes hex-encoded.
    pub async fn create(
        &self,
        device_id: &Uuid,
        ttl: Duration,
    ) -> Result<PublicQrLink, AppError> {
        let token = generate_token();

        let link = sqlx::query_as::<_, PublicQrLink>(
            r#"
            INSERT INTO public_qr_links (device_id, token, expires_at)
            VALUES ($1, $2, $3)
            RETURNING id, device_id, token, expires_at, created_at
            "#,
        )
        .bind(device_id)
        .bind(&token)
        .bind(Utc::now() + ttl)
        .fetch_one(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to create QR link: {}", e)))?;

        Ok(link)
    }

    pub async fn get_by_token(&self, token: &str) -> Result<Option<PublicQrLink>, AppError> {
        let link = sqlx::query_as::<_, PublicQrLink>(
            r#"
            SELECT id, device_id, token, expires_at, created_at
            FROM public_qr_links
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to fetch QR link: {}", e)))?;

        Ok(link)
    }

    /// Invalidate every live link of a device. Called on the ONLINE transition
    /// so a paired device never keeps an exposed QR.
    pub async fn expire_active_for_device(&self, device_id: &Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE public_qr_links
            SET expires_at = NOW()
            WHERE device_id = $1 AND expires_at > NOW()
            "#,
        )
        .bind(device_id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to expire QR links: {}", e)))?;

        Ok(result.rows_affected())
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
