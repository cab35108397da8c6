use crate::db::{Device, DeviceRepository, OutboundMessage, OutboundMessageRepository};
use crate::models::DeviceStatus;
use crate::ops::DbLogSink;
use crate::queue::{Job, JobHandler, JobOutcome};
use crate::session::{PresenceScheduler, SessionManager};
use crate::transport::{OutgoingMessage, Presence};
use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const QUEUE_WAIT_WARN: Duration = Duration::from_secs(30);
const SEND_DURATION_WARN: Duration = Duration::from_secs(5);

/// Decision of the pre-send validation ladder. Terminal outcomes are written
/// to the row and never retried; a retryable reason leaves the row PROCESSING
/// for the queue to try again.
#[derive(Debug, PartialEq)]
pub enum OutboundValidation {
    Ready { text: String },
    Terminal { error: String },
    Retryable { reason: String },
}

/// Checks in order: device exists, device ONLINE, socket present, socket
/// authenticated, type supported, payload usable.
pub fn validate_outbound(
    message: &OutboundMessage,
    device: Option<&Device>,
    socket_present: bool,
    socket_user: Option<&str>,
) -> OutboundValidation {
    let Some(device) = device else {
        return OutboundValidation::Terminal {
            error: "device_not_found".to_string(),
        };
    };

    if device.status() != Some(DeviceStatus::Online) {
        return OutboundValidation::Terminal {
            error: format!("device_not_online:{}", device.status),
        };
    }

    if !socket_present {
        return OutboundValidation::Terminal {
            error: "device_not_connected".to_string(),
        };
    }

    if socket_user.is_none() {
        return OutboundValidation::Terminal {
            error: "socket_not_authenticated".to_string(),
        };
    }

    if message.message_type != "text" {
        return OutboundValidation::Terminal {
            error: format!("unsupported_type:{}", message.message_type),
        };
    }

    match message.payload_json.get("text").and_then(|v| v.as_str()) {
        Some(text) if !text.is_empty() => OutboundValidation::Ready {
            text: text.to_string(),
        },
        _ => OutboundValidation::Retryable {
            reason: "outbound payload has no text".to_string(),
        },
    }
}

/// Consumer of the `outbound_messages` queue.
pub struct OutboundDispatcher {
    messages: OutboundMessageRepository,
    devices: DeviceRepository,
    manager: SessionManager,
    presence: PresenceScheduler,
    db_log: DbLogSink,
    composing_delay: Duration,
}

impl OutboundDispatcher {
    pub fn new(
        messages: OutboundMessageRepository,
        devices: DeviceRepository,
        manager: SessionManager,
        presence: PresenceScheduler,
        db_log: DbLogSink,
        composing_delay_ms: u64,
    ) -> Self {
        Self {
            messages,
            devices,
            manager,
            presence,
            db_log,
            composing_delay: Duration::from_millis(composing_delay_ms),
        }
    }

    fn message_id(job: &Job) -> Option<Uuid> {
        job.payload
            .get("outboundMessageId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[async_trait]
impl JobHandler for OutboundDispatcher {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let Some(message_id) = Self::message_id(job) else {
            return JobOutcome::Terminal("send job without outboundMessageId".to_string());
        };

        let message = match self.messages.get(&message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                // Nothing to transition; retrying cannot make the row appear.
                log::error!("Outbound message {} not found, dropping job", message_id);
                return JobOutcome::Ok;
            }
            Err(e) => return JobOutcome::Retry(format!("load outbound {}: {}", message_id, e)),
        };

        let queue_wait = Duration::from_millis(
            (Utc::now().timestamp_millis() - job.enqueued_at_ms).max(0) as u64,
        );
        if queue_wait > QUEUE_WAIT_WARN {
            self.db_log.warn(
                "Outbound message waited unusually long in queue",
                Some(serde_json::json!({
                    "outboundMessageId": message_id,
                    "queueWaitMs": queue_wait.as_millis() as i64,
                })),
                Some(message.device_id),
            );
        }

        if let Err(e) = self.messages.mark_processing(&message_id).await {
            return JobOutcome::Retry(format!("mark processing {}: {}", message_id, e));
        }

        let device = match self.devices.get(&message.device_id).await {
            Ok(device) => device,
            Err(e) => return JobOutcome::Retry(format!("load device: {}", e)),
        };

        let socket = self.manager.get(&message.device_id);
        let socket_user = socket.as_ref().and_then(|s| s.authenticated_user());

        let text = match validate_outbound(
            &message,
            device.as_ref(),
            socket.is_some(),
            socket_user.as_deref(),
        ) {
            OutboundValidation::Ready { text } => text,
            OutboundValidation::Terminal { error } => {
                if let Err(e) = self.messages.mark_failed(&message_id, &error).await {
                    log::error!("Failed to record outbound failure {}: {}", message_id, e);
                }
                return JobOutcome::Terminal(error);
            }
            OutboundValidation::Retryable { reason } => {
                return JobOutcome::Retry(reason);
            }
        };

        let Some(socket) = socket else {
            // The session vanished between validation and send.
            if let Err(e) = self
                .messages
                .mark_failed(&message_id, "device_not_connected")
                .await
            {
                log::error!("Failed to record outbound failure {}: {}", message_id, e);
            }
            return JobOutcome::Terminal("device_not_connected".to_string());
        };
        let send_started = Instant::now();

        // An explicit send supersedes any pending inbound "paused" timer for
        // this chat; this cycle emits its own presence pair.
        self.presence.supersede(&message.device_id, &message.to);

        if let Err(e) = socket
            .send_presence_update(Presence::Composing, &message.to)
            .await
        {
            log::debug!("Composing presence to {} failed: {}", message.to, e);
        }

        tokio::time::sleep(self.composing_delay).await;

        let sent = match socket
            .send_message(&message.to, &OutgoingMessage { text })
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                // Row stays PROCESSING while retries remain; the exhaustion
                // hook transitions it to FAILED.
                return JobOutcome::Retry(format!("send failed: {}", e));
            }
        };

        if let Err(e) = socket
            .send_presence_update(Presence::Paused, &message.to)
            .await
        {
            log::debug!("Paused presence to {} failed: {}", message.to, e);
        }

        if let Err(e) = self.messages.mark_sent(&message_id, Some(sent.id.as_str())).await {
            return JobOutcome::Retry(format!("mark sent {}: {}", message_id, e));
        }

        let send_duration = send_started.elapsed();
        if send_duration > SEND_DURATION_WARN {
            self.db_log.warn(
                "Outbound send took unusually long",
                Some(serde_json::json!({
                    "outboundMessageId": message_id,
                    "sendDurationMs": send_duration.as_millis() as i64,
                })),
                Some(message.device_id),
            );
        }

        JobOutcome::Ok
    }

    async fn on_exhausted(&self, job: &Job, reason: &str) {
        let Some(message_id) = Self::message_id(job) else {
            return;
        };
        if let Err(e) = self.messages.mark_failed(&message_id, reason).await {
            log::error!(
                "Failed to mark exhausted outbound {} as FAILED: {}",
                message_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(message_type: &str, payload: serde_json::Value) -> OutboundMessage {
        OutboundMessage {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            to: "5491122223333@s.whatsapp.net".to_string(),
            message_type: message_type.to_string(),
            payload_json: payload,
            is_test: false,
            status: "PROCESSING".to_string(),
            provider_message_id: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn device(status: &str) -> Device {
        Device {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            label: "test".to_string(),
            phone_hint: None,
            status: status.to_string(),
            qr: None,
            last_error: None,
            last_seen_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn missing_device_is_terminal() {
        let message = outbound("text", serde_json::json!({"text": "hi"}));
        assert_eq!(
            validate_outbound(&message, None, false, None),
            OutboundValidation::Terminal {
                error: "device_not_found".to_string()
            }
        );
    }

    #[test]
    fn offline_device_is_terminal_with_the_observed_status() {
        let message = outbound("text", serde_json::json!({"text": "hi"}));
        let d = device("OFFLINE");
        assert_eq!(
            validate_outbound(&message, Some(&d), true, Some("me@s.whatsapp.net")),
            OutboundValidation::Terminal {
                error: "device_not_online:OFFLINE".to_string()
            }
        );
    }

    #[test]
    fn absent_socket_and_unauthenticated_socket_are_terminal() {
        let message = outbound("text", serde_json::json!({"text": "hi"}));
        let d = device("ONLINE");
        assert_eq!(
            validate_outbound(&message, Some(&d), false, None),
            OutboundValidation::Terminal {
                error: "device_not_connected".to_string()
            }
        );
        assert_eq!(
            validate_outbound(&message, Some(&d), true, None),
            OutboundValidation::Terminal {
                error: "socket_not_authenticated".to_string()
            }
        );
    }

    #[test]
    fn unsupported_type_is_terminal() {
        let message = outbound("image", serde_json::json!({"text": "hi"}));
        let d = device("ONLINE");
        assert_eq!(
            validate_outbound(&message, Some(&d), true, Some("me@s.whatsapp.net")),
            OutboundValidation::Terminal {
                error: "unsupported_type:image".to_string()
            }
        );
    }

    #[test]
    fn empty_text_is_retryable() {
        let d = device("ONLINE");
        for payload in [
            serde_json::json!({}),
            serde_json::json!({"text": ""}),
            serde_json::json!({"text": 42}),
        ] {
            let message = outbound("text", payload);
            assert!(matches!(
                validate_outbound(&message, Some(&d), true, Some("me@s.whatsapp.net")),
                OutboundValidation::Retryable { .. }
            ));
        }
    }

    #[test]
    fn valid_message_is_ready_with_its_text() {
        let message = outbound("text", serde_json::json!({"text": "hola"}));
        let d = device("ONLINE");
        assert_eq!(
            validate_outbound(&message, Some(&d), true, Some("me@s.whatsapp.net")),
            OutboundValidation::Ready {
                text: "hola".to_string()
            }
        );
    }
}
