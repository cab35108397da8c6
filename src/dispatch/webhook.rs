use crate::db::{DeliveryWithTarget, WebhookDeliveryRepository};
use crate::error::AppError;
use crate::queue::{backoff_delay, Job, JobHandler, JobOptions, JobOutcome, QueueRuntime, WEBHOOK_DISPATCH};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const ERROR_BODY_SNIPPET: usize = 200;

const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);
const RECOVERY_MIN_AGE_SECS: i64 = 300;
const RECOVERY_BATCH: i64 = 100;

pub const DELIVER_JOB: &str = "deliver";

/// Retry policy shared by every producer of `deliver` jobs.
pub fn deliver_job_options() -> JobOptions {
    JobOptions {
        max_attempts: 5,
        backoff_base_ms: 1000,
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Byte-semantic webhook body. Field order is part of the contract because
/// the signature covers the serialized bytes.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    event_id: Uuid,
    tenant_id: Uuid,
    device_id: Uuid,
    #[serde(rename = "type")]
    event_type: &'a str,
    normalized: &'a serde_json::Value,
    raw: &'a serde_json::Value,
    created_at: String,
}

pub fn build_payload_body(delivery: &DeliveryWithTarget) -> Result<String, AppError> {
    let payload = WebhookPayload {
        event_id: delivery.event_id,
        tenant_id: delivery.tenant_id,
        device_id: delivery.device_id,
        event_type: &delivery.event_type,
        normalized: &delivery.normalized_json,
        raw: &delivery.raw_json,
        created_at: delivery
            .event_created_at
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    Ok(serde_json::to_string(&payload)?)
}

/// `HMAC_SHA256_hex(secret, "{timestamp}.{body}")`, the scheme receivers
/// verify against the `x-timestamp` and `x-signature` headers.
pub fn sign_payload(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Consumer of the `webhook_dispatch` queue: POST the signed payload, record
/// the outcome, and walk the retry ladder into DLQ on exhaustion.
pub struct WebhookDispatcher {
    deliveries: WebhookDeliveryRepository,
    http_client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(deliveries: WebhookDeliveryRepository) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            deliveries,
            http_client,
        }
    }

    fn delivery_id(job: &Job) -> Option<Uuid> {
        job.payload
            .get("deliveryId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    async fn post_once(&self, delivery: &DeliveryWithTarget) -> Result<(), String> {
        let body = build_payload_body(delivery).map_err(|e| e.to_string())?;
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = sign_payload(&delivery.endpoint_secret, &timestamp, &body);

        let response = self
            .http_client
            .post(&delivery.endpoint_url)
            .header("content-type", "application/json")
            .header("x-event-id", delivery.event_id.to_string())
            .header("x-tenant-id", delivery.tenant_id.to_string())
            .header("x-device-id", delivery.device_id.to_string())
            .header("x-event-type", delivery.event_type.as_str())
            .header("x-timestamp", timestamp.as_str())
            .header("x-signature", signature.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body_text = response.text().await.unwrap_or_default();
        let snippet: String = body_text.chars().take(ERROR_BODY_SNIPPET).collect();
        Err(format!("HTTP {}: {}", status.as_u16(), snippet))
    }

    /// Record the failed attempt on the row: FAILED with a retry horizon while
    /// attempts remain, DLQ bookkeeping is handled by `on_exhausted`.
    async fn record_failure(&self, job: &Job, delivery_id: &Uuid, error: &str) {
        let attempts = (job.attempt + 1) as i32;
        if (job.attempt + 1) < job.max_attempts {
            let retry_in = backoff_delay(job.backoff_base_ms, job.attempt + 1);
            let retry_in = chrono::Duration::from_std(retry_in)
                .unwrap_or_else(|_| chrono::Duration::seconds(2));
            if let Err(e) = self
                .deliveries
                .mark_failed_retrying(delivery_id, attempts, error, retry_in)
                .await
            {
                log::error!("Failed to record delivery failure {}: {}", delivery_id, e);
            }
        }
    }
}

#[async_trait]
impl JobHandler for WebhookDispatcher {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let Some(delivery_id) = Self::delivery_id(job) else {
            return JobOutcome::Terminal("deliver job without deliveryId".to_string());
        };

        let delivery = match self.deliveries.get_with_target(&delivery_id).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                log::warn!("Webhook delivery {} vanished, dropping job", delivery_id);
                return JobOutcome::Ok;
            }
            Err(e) => return JobOutcome::Retry(format!("load delivery {}: {}", delivery_id, e)),
        };

        if !delivery.endpoint_enabled {
            log::info!(
                "Endpoint {} disabled, skipping delivery {}",
                delivery.endpoint_id,
                delivery_id
            );
            return JobOutcome::Ok;
        }

        match self.post_once(&delivery).await {
            Ok(()) => {
                if let Err(e) = self.deliveries.mark_success(&delivery_id).await {
                    return JobOutcome::Retry(format!("mark success {}: {}", delivery_id, e));
                }
                JobOutcome::Ok
            }
            Err(error) => {
                self.record_failure(job, &delivery_id, &error).await;
                JobOutcome::Retry(error)
            }
        }
    }

    async fn on_exhausted(&self, job: &Job, reason: &str) {
        let Some(delivery_id) = Self::delivery_id(job) else {
            return;
        };
        let attempts = (job.attempt + 1) as i32;
        if let Err(e) = self
            .deliveries
            .mark_dlq(&delivery_id, attempts, reason)
            .await
        {
            log::error!("Failed to dead-letter delivery {}: {}", delivery_id, e);
        }
    }
}

/// Re-enqueue deliveries whose job was lost after the fan-out transaction
/// committed (the enqueue itself failed). PENDING past the cutoff means no
/// job exists anywhere for the row; receivers are idempotent, so the rare
/// duplicate from a slow broker backlog is harmless.
pub async fn recover_stale_deliveries(
    deliveries: &WebhookDeliveryRepository,
    queues: &QueueRuntime,
    older_than: chrono::Duration,
) -> Result<usize, AppError> {
    let stale = deliveries
        .list_stale_pending(older_than, RECOVERY_BATCH)
        .await?;
    let mut recovered = 0;

    for delivery_id in stale {
        queues
            .enqueue(
                WEBHOOK_DISPATCH,
                DELIVER_JOB,
                serde_json::json!({ "deliveryId": delivery_id }),
                deliver_job_options(),
            )
            .await?;
        recovered += 1;
    }

    if recovered > 0 {
        log::info!("Re-enqueued {} stuck webhook deliveries", recovered);
    }

    Ok(recovered)
}

pub fn spawn_delivery_recovery(
    deliveries: WebhookDeliveryRepository,
    queues: QueueRuntime,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RECOVERY_INTERVAL);
        loop {
            interval.tick().await;
            let older_than = chrono::Duration::seconds(RECOVERY_MIN_AGE_SECS);
            if let Err(e) = recover_stale_deliveries(&deliveries, &queues, older_than).await {
                log::warn!("Delivery recovery pass failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn delivery() -> DeliveryWithTarget {
        DeliveryWithTarget {
            id: Uuid::new_v4(),
            endpoint_id: Uuid::new_v4(),
            event_id: Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap(),
            status: "PENDING".to_string(),
            attempts: 0,
            endpoint_url: "https://bots.example.com/hook".to_string(),
            endpoint_secret: "whsec_test".to_string(),
            endpoint_enabled: true,
            tenant_id: Uuid::parse_str("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee").unwrap(),
            device_id: Uuid::parse_str("99999999-8888-7777-6666-555555555555").unwrap(),
            event_type: "message.inbound".to_string(),
            normalized_json: serde_json::json!({
                "kind": "inbound_message",
                "content": {"type": "text", "text": "hola", "media": null},
            }),
            raw_json: serde_json::json!({"key": {"id": "MSG1"}}),
            event_created_at: Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn body_preserves_field_order_and_millisecond_timestamps() {
        let body = build_payload_body(&delivery()).unwrap();

        assert!(body.starts_with("{\"eventId\":"));
        let order = [
            "\"eventId\"",
            "\"tenantId\"",
            "\"deviceId\"",
            "\"type\"",
            "\"normalized\"",
            "\"raw\"",
            "\"createdAt\"",
        ];
        let mut last = 0;
        for field in order {
            let position = body.find(field).expect(field);
            assert!(position >= last, "{} out of order", field);
            last = position;
        }
        assert!(body.contains("\"createdAt\":\"2026-01-15T00:00:00.000Z\""));
        assert!(body.contains("\"type\":\"message.inbound\""));
    }

    #[test]
    fn signature_is_deterministic_and_covers_every_byte() {
        let body = build_payload_body(&delivery()).unwrap();
        let timestamp = "1736900000000";

        let first = sign_payload("whsec_test", timestamp, &body);
        let second = sign_payload("whsec_test", timestamp, &body);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let mut altered_body = body.clone();
        altered_body.replace_range(body.len() - 2..body.len() - 1, "x");
        assert_ne!(first, sign_payload("whsec_test", timestamp, &altered_body));
        assert_ne!(first, sign_payload("whsec_test", "1736900000001", &body));
        assert_ne!(first, sign_payload("other_secret", timestamp, &body));
    }

    #[test]
    fn signature_matches_the_documented_concatenation() {
        // Signing "{timestamp}.{body}" in one buffer must equal the streamed
        // update path used by the dispatcher.
        let body = "{\"x\":1}";
        let timestamp = "42";

        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(sign_payload("secret", timestamp, body), expected);
    }

    #[test]
    fn error_snippets_are_bounded() {
        let long_body = "e".repeat(1000);
        let snippet: String = long_body.chars().take(ERROR_BODY_SNIPPET).collect();
        assert_eq!(snippet.len(), 200);
    }
}
