use crate::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Pool sized for the worker's concurrency model: 5 outbound + 10 webhook
/// jobs in flight plus session bookkeeping share these connections.
const POOL_MAX_CONNECTIONS: u32 = 16;

/// Waits between connect attempts. After the last attempt the worker exits
/// and lets the supervisor restart it instead of idling half-started with a
/// live health endpoint.
const CONNECT_RETRY_WAITS: [u64; 3] = [1, 3, 8];

fn pool_options() -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(60))
}

/// Bad credentials or a missing database never fix themselves by waiting.
fn is_unrecoverable(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // invalid_password, invalid_authorization_specification,
            // invalid_catalog_name
            Some("28P01") | Some("28000") | Some("3D000")
        ),
        sqlx::Error::Configuration(_) => true,
        _ => false,
    }
}

/// Open the PostgreSQL pool shared by every repository, waiting out broker
/// and database races at boot (deploys bring the worker and the store up
/// together) but failing fast on rejections.
pub async fn create_pool(database_url: &str) -> Result<PgPool, AppError> {
    let mut waits = CONNECT_RETRY_WAITS.iter().copied();

    loop {
        match pool_options().connect(database_url).await {
            Ok(pool) => {
                log::info!(
                    "Database pool ready ({} connections max)",
                    POOL_MAX_CONNECTIONS
                );
                return Ok(pool);
            }
            Err(e) if is_unrecoverable(&e) => {
                log::error!("Database rejected the worker, not retrying: {}", e);
                return Err(AppError::Database(e.to_string()));
            }
            Err(e) => match waits.next() {
                Some(wait) => {
                    log::warn!("Database not reachable ({}), next attempt in {}s", e, wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                None => {
                    log::error!(
                        "Database unreachable after {} attempts, exiting for restart",
                        CONNECT_RETRY_WAITS.len() + 1
                    );
                    return Err(AppError::Database(e.to_string()));
                }
            },
        }
    }
}

/// One-row probe so a dead pool or bad search path fails at startup, not on
/// the first inbound message.
pub async fn verify_connection(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query_as::<_, (i32,)>("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| AppError::Database(format!("connection probe failed: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn rejections_are_unrecoverable_transport_faults_are_not() {
        assert!(is_unrecoverable(&sqlx::Error::Configuration(
            "bad url".into()
        )));
        assert!(!is_unrecoverable(&sqlx::Error::RowNotFound));
        assert!(!is_unrecoverable(&sqlx::Error::PoolTimedOut));
    }

    #[tokio::test]
    async fn pool_connects_and_probes_when_a_database_is_available() {
        // Only runs when DATABASE_URL is set in the environment
        if let Ok(url) = env::var("DATABASE_URL") {
            if let Ok(pool) = create_pool(&url).await {
                assert!(verify_connection(&pool).await.is_ok());
            }
        }
    }
}
