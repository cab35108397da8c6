use crate::db::{
    DeviceRepository, EventRepository, OutboundMessageRepository, WebhookDelivery,
    WebhookDeliveryRepository, WebhookEndpointRepository,
};
use crate::dispatch::webhook::{deliver_job_options, DELIVER_JOB};
use crate::error::AppError;
use crate::models::EVENT_TYPE_MESSAGE_INBOUND;
use crate::normalizer::{self, NormalizedInboundMessage, STATUS_BROADCAST_JID};
use crate::ops::DbLogSink;
use crate::queue::{JobOptions, QueueRuntime, OUTBOUND_MESSAGES, WEBHOOK_DISPATCH};
use crate::session::presence::PresenceScheduler;
use crate::transport::{ChatSocket, Presence, RawMessage};
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const PAUSED_PRESENCE_DELAY: Duration = Duration::from_secs(25);
const SLOW_INBOUND_THRESHOLD: Duration = Duration::from_secs(1);
const INBOUND_ACK_ATTEMPTS: u32 = 3;

/// Stub texts the upstream transport emits when it could not decrypt a
/// message. Observed wording; matched case-insensitively as substrings.
const DECRYPTION_FAILURE_PATTERNS: &[&str] = &[
    "no matching sessions found for message",
    "bad mac",
    "failed to decrypt message",
];

/// Tells the session manager to evict the peer's sender keys and recycle the
/// socket.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSignal {
    pub remote_jid: String,
    pub sender_pn: Option<String>,
}

#[derive(Clone)]
pub struct InboundPipeline {
    db_pool: PgPool,
    devices: DeviceRepository,
    events: EventRepository,
    endpoints: WebhookEndpointRepository,
    deliveries: WebhookDeliveryRepository,
    outbound: OutboundMessageRepository,
    queues: QueueRuntime,
    presence: PresenceScheduler,
    db_log: DbLogSink,
    ack_message: Option<String>,
}

impl InboundPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_pool: PgPool,
        devices: DeviceRepository,
        events: EventRepository,
        endpoints: WebhookEndpointRepository,
        deliveries: WebhookDeliveryRepository,
        outbound: OutboundMessageRepository,
        queues: QueueRuntime,
        presence: PresenceScheduler,
        db_log: DbLogSink,
        ack_message: Option<String>,
    ) -> Self {
        Self {
            db_pool,
            devices,
            events,
            endpoints,
            deliveries,
            outbound,
            queues,
            presence,
            db_log,
            ack_message,
        }
    }

    /// Own sends, status broadcasts and keyless envelopes never enter the
    /// pipeline.
    pub fn should_process(raw: &RawMessage) -> bool {
        match &raw.key {
            Some(key) => !key.from_me && key.remote_jid != STATUS_BROADCAST_JID,
            None => false,
        }
    }

    pub async fn process(
        &self,
        socket: &Arc<dyn ChatSocket>,
        device_id: Uuid,
        tenant_id: Uuid,
        raw: RawMessage,
    ) -> Result<Option<ReconcileSignal>, AppError> {
        if !Self::should_process(&raw) {
            return Ok(None);
        }

        let started = Instant::now();
        let Some(key) = raw.key.clone() else {
            return Ok(None);
        };

        self.acknowledge(socket, device_id, &key.remote_jid, &raw).await;

        let own_jid = socket.authenticated_user();
        let Some(normalized) = normalizer::normalize(&raw, own_jid.as_deref()) else {
            return Ok(None);
        };
        let raw_json = serde_json::to_value(&raw)?;

        let result = if normalized.content.content_type == "stub" {
            let stub_text = normalized.content.text.clone().unwrap_or_default();
            if is_decryption_failure_text(&stub_text) {
                // Let bots respond "could not read, please resend": the event
                // still fans out, flagged so receivers can tell it apart.
                let normalized_json = decryption_failed_json(&normalized)?;
                self.persist_with_fanout(tenant_id, device_id, &normalized_json, &raw_json)
                    .await?;

                Ok(Some(ReconcileSignal {
                    remote_jid: key.remote_jid.clone(),
                    sender_pn: key.sender_pn.clone(),
                }))
            } else {
                // Unactionable protocol chatter; only bookkeep liveness.
                let _ = self.devices.touch_last_seen(&device_id).await;
                Ok(None)
            }
        } else {
            let normalized_json = serde_json::to_value(&normalized)?;
            self.persist_with_fanout(tenant_id, device_id, &normalized_json, &raw_json)
                .await?;
            self.maybe_enqueue_inbound_ack(tenant_id, device_id, &normalized)
                .await;
            Ok(None)
        };

        if let Err(e) = self.devices.touch_last_seen(&device_id).await {
            log::warn!("Failed to bookkeep last_seen_at for {}: {}", device_id, e);
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_INBOUND_THRESHOLD {
            let message_age_ms = raw
                .message_timestamp
                .map(|ts| Utc::now().timestamp_millis() - ts * 1000);
            self.db_log.warn(
                "Slow inbound message processing",
                Some(serde_json::json!({
                    "processingTimeMs": elapsed.as_millis() as i64,
                    "messageAgeMs": message_age_ms,
                })),
                Some(device_id),
            );
        }

        result
    }

    /// Typing presence, a scheduled pause, and the read receipt. All
    /// best-effort; the pipeline carries on if any of them fail.
    async fn acknowledge(
        &self,
        socket: &Arc<dyn ChatSocket>,
        device_id: Uuid,
        chat_jid: &str,
        raw: &RawMessage,
    ) {
        if let Err(e) = socket
            .send_presence_update(Presence::Composing, chat_jid)
            .await
        {
            log::debug!("Typing presence to {} failed: {}", chat_jid, e);
        }

        self.presence.schedule_paused(
            socket.clone(),
            device_id,
            chat_jid,
            PAUSED_PRESENCE_DELAY,
        );

        if let Some(key) = &raw.key {
            if let Err(e) = socket.read_messages(std::slice::from_ref(key)).await {
                log::debug!("Read receipt for {} failed: {}", key.id, e);
            }
        }
    }

    /// The event row and its delivery fan-out commit together; a delivery row
    /// without an event can never exist.
    async fn persist_with_fanout(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        normalized_json: &JsonValue,
        raw_json: &JsonValue,
    ) -> Result<(), AppError> {
        let mut tx = self
            .db_pool
            .begin()
            .await
            .map_err(|e| AppError::Database(format!("Failed to open transaction: {}", e)))?;

        let event = self
            .events
            .insert(
                &mut tx,
                &tenant_id,
                &device_id,
                EVENT_TYPE_MESSAGE_INBOUND,
                normalized_json,
                raw_json,
            )
            .await?;

        let endpoints = self
            .endpoints
            .list_enabled_for_tenant(&mut tx, &tenant_id)
            .await?;

        let mut deliveries: Vec<WebhookDelivery> = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            deliveries.push(self.deliveries.insert(&mut tx, &endpoint.id, &event.id).await?);
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Database(format!("Failed to commit event fan-out: {}", e)))?;

        for delivery in &deliveries {
            let enqueue = self
                .queues
                .enqueue(
                    WEBHOOK_DISPATCH,
                    DELIVER_JOB,
                    serde_json::json!({ "deliveryId": delivery.id }),
                    deliver_job_options(),
                )
                .await;
            if let Err(e) = enqueue {
                // Row stays PENDING; the stale-delivery recovery loop
                // re-enqueues it on its next pass.
                log::error!(
                    "Failed to enqueue delivery {}, leaving it for recovery: {}",
                    delivery.id,
                    e
                );
            }
        }

        Ok(())
    }

    /// The configured fast reply that guarantees the chat visibly receives
    /// something regardless of bot latency.
    async fn maybe_enqueue_inbound_ack(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        normalized: &NormalizedInboundMessage,
    ) {
        let Some(text) = &self.ack_message else {
            return;
        };

        let created = self
            .outbound
            .create(
                &tenant_id,
                &device_id,
                &normalized.from,
                "text",
                &serde_json::json!({ "text": text }),
                false,
            )
            .await;

        let message = match created {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to create inbound ack outbound row: {}", e);
                return;
            }
        };

        let enqueue = self
            .queues
            .enqueue(
                OUTBOUND_MESSAGES,
                "send",
                serde_json::json!({ "outboundMessageId": message.id }),
                JobOptions {
                    max_attempts: INBOUND_ACK_ATTEMPTS,
                    backoff_base_ms: 1000,
                },
            )
            .await;
        if let Err(e) = enqueue {
            log::error!("Failed to enqueue inbound ack {}: {}", message.id, e);
        }
    }
}

pub fn is_decryption_failure_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    DECRYPTION_FAILURE_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// Normalized payload with the decryption flag merged in, raw preserved
/// verbatim by the caller.
pub fn decryption_failed_json(
    normalized: &NormalizedInboundMessage,
) -> Result<JsonValue, AppError> {
    let mut value = serde_json::to_value(normalized)?;
    value
        .as_object_mut()
        .ok_or_else(|| AppError::Internal("normalized message is not an object".to_string()))?
        .insert("decryptionFailed".to_string(), JsonValue::Bool(true));
    Ok(value)
}
