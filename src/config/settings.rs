use crate::error::AppError;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub vault: VaultConfig,
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub inbound: InboundConfig,
    pub outbound: OutboundConfig,
    pub transport: TransportConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Raw 32-byte AEAD key, already decoded from WA_AUTH_ENC_KEY_B64.
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub health_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub all_delay_ms: u64,
    pub stagger_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundConfig {
    /// If set, every inbound message gets this text enqueued back immediately.
    pub ack_message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub composing_before_send_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: String,
}

/// Mailgun alert settings. All optional; when absent, crash alert emails are
/// skipped and the worker only logs.
#[derive(Clone, Debug)]
pub struct AlertConfig {
    pub api_key: String,
    pub domain: String,
    pub from_email: String,
    pub from_name: String,
    pub recipient: String,
    pub base_url: Option<String>,
}

impl AlertConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: env::var("MAILGUN_API_KEY").ok()?,
            domain: env::var("MAILGUN_DOMAIN").ok()?,
            from_email: env::var("FROM_EMAIL").ok()?,
            from_name: env::var("FROM_NAME").unwrap_or_else(|_| "wagate worker".to_string()),
            recipient: env::var("ADMIN_EMAIL_RECIPIENT").ok()?,
            base_url: env::var("MAILGUN_BASE_URL").ok(),
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64, AppError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .map_err(|_| AppError::Configuration(format!("{} must be a valid number", name)))
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Configuration("DATABASE_URL must be set".to_string()))?;

        let redis_url = env::var("REDIS_URL")
            .map_err(|_| AppError::Configuration("REDIS_URL must be set".to_string()))?;

        // The vault key is required and must decode to exactly 32 bytes. Every
        // worker sharing the store must be configured with the same key.
        let key_b64 = env::var("WA_AUTH_ENC_KEY_B64")
            .map_err(|_| AppError::Configuration("WA_AUTH_ENC_KEY_B64 must be set".to_string()))?;
        let key = base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|_| {
                AppError::Configuration("WA_AUTH_ENC_KEY_B64 must be valid base64".to_string())
            })?;
        if key.len() != 32 {
            return Err(AppError::Configuration(format!(
                "WA_AUTH_ENC_KEY_B64 must decode to 32 bytes, got {}",
                key.len()
            )));
        }

        let health_port = env::var("WORKER_HEALTH_PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse::<u16>()
            .map_err(|_| {
                AppError::Configuration("WORKER_HEALTH_PORT must be a valid port number".to_string())
            })?;

        let all_delay_ms = env_u64("WORKER_RECONNECT_ALL_DELAY_MS", 5000)?;
        let stagger_ms = env_u64("WORKER_RECONNECT_STAGGER_MS", 5000)?;
        let composing_before_send_ms = env_u64("WORKER_COMPOSING_BEFORE_SEND_MS", 1500)?;

        let ack_message = env::var("WORKER_INBOUND_ACK_MESSAGE")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let transport_kind = env::var("CHAT_TRANSPORT").unwrap_or_else(|_| "memory".to_string());

        Ok(Self {
            database: DatabaseConfig { url: database_url },
            redis: RedisConfig { url: redis_url },
            vault: VaultConfig { key },
            server: ServerConfig { health_port },
            reconnect: ReconnectConfig {
                all_delay_ms,
                stagger_ms,
            },
            inbound: InboundConfig { ack_message },
            outbound: OutboundConfig {
                composing_before_send_ms,
            },
            transport: TransportConfig {
                kind: transport_kind,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u64_falls_back_to_default() {
        assert_eq!(env_u64("WAGATE_TEST_UNSET_VAR", 42).unwrap(), 42);
    }

    #[test]
    fn alert_config_is_optional() {
        // None of the Mailgun variables are set in the test environment.
        if env::var("MAILGUN_API_KEY").is_err() {
            assert!(AlertConfig::from_env().is_none());
        }
    }
}
