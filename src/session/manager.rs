use crate::db::{DeviceRepository, EventRepository, PublicQrLinkRepository};
use crate::error::AppError;
use crate::inbound::{InboundPipeline, ReconcileSignal};
use crate::models::DeviceStatus;
use crate::ops::DbLogSink;
use crate::session::auth_state::{AuthStateHandle, AuthStateStore};
use crate::session::presence::PresenceScheduler;
use crate::transport::{
    ChatSocket, ChatTransport, ConnectOptions, ConnectionState, ConnectionUpdate,
    DisconnectReason, GetMessageLookup, MessageKey, ProtocolVersion, TransportEvent, UpsertType,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const RECONCILE_RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct SessionEntry {
    socket: Arc<dyn ChatSocket>,
    closing: Arc<AtomicBool>,
}

/// Process-wide registry of live sessions, one per device. The registry is the
/// authoritative presence view for this worker: readers get clones of the
/// socket handle and may observe a stale nil, never a dangling session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    sessions: DashMap<Uuid, SessionEntry>,
    transport: Arc<dyn ChatTransport>,
    auth_store: AuthStateStore,
    devices: DeviceRepository,
    events: EventRepository,
    qr_links: PublicQrLinkRepository,
    pipeline: InboundPipeline,
    presence: PresenceScheduler,
    db_log: DbLogSink,
    protocol_version: tokio::sync::OnceCell<ProtocolVersion>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        auth_store: AuthStateStore,
        devices: DeviceRepository,
        events: EventRepository,
        qr_links: PublicQrLinkRepository,
        pipeline: InboundPipeline,
        presence: PresenceScheduler,
        db_log: DbLogSink,
    ) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: DashMap::new(),
                transport,
                auth_store,
                devices,
                events,
                qr_links,
                pipeline,
                presence,
                db_log,
                protocol_version: tokio::sync::OnceCell::new(),
            }),
        }
    }

    /// Open a session for the device. Idempotent: a live session wins and the
    /// call is a no-op, which is what absorbs races between the reconnect
    /// sweep and per-close reconnect timers.
    pub async fn connect(&self, device_id: Uuid) -> Result<(), AppError> {
        if self.inner.sessions.contains_key(&device_id) {
            debug!(device_id = %device_id, "connect ignored, session already live");
            return Ok(());
        }

        let device = self
            .inner
            .devices
            .get(&device_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Device not found: {}", device_id)))?;

        self.inner
            .devices
            .set_state(&device_id, DeviceStatus::Offline, None, Some(None))
            .await?;

        let auth = self.inner.auth_store.load(device_id).await;

        let result = self.open_socket(device_id, &auth).await;
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                let message = format!("connect_error: {}", e);
                if let Err(mark_err) = self.inner.devices.mark_error(&device_id, &message).await {
                    warn!(device_id = %device_id, error = %mark_err, "failed to annotate connect error");
                }
                self.inner.db_log.error(
                    "Device connect failed",
                    Some(message.as_str()),
                    None,
                    Some(device_id),
                );
                return Err(e);
            }
        };

        let closing = Arc::new(AtomicBool::new(false));
        self.inner.sessions.insert(
            device_id,
            SessionEntry {
                socket: session.socket.clone(),
                closing: closing.clone(),
            },
        );

        info!(device_id = %device_id, tenant_id = %device.tenant_id, "session opened, event loop starting");

        let manager = self.clone();
        let socket = session.socket;
        let events = session.events;
        tokio::spawn(async move {
            manager
                .run_device_loop(device_id, device.tenant_id, events, socket, auth, closing)
                .await;
        });

        Ok(())
    }

    async fn open_socket(
        &self,
        device_id: Uuid,
        auth: &Arc<AuthStateHandle>,
    ) -> Result<crate::transport::ChatSession, AppError> {
        let version = *self
            .inner
            .protocol_version
            .get_or_try_init(|| async { self.inner.transport.fetch_protocol_version().await })
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let opts = ConnectOptions {
            device_id,
            creds: auth.creds().await,
            keys: auth.clone(),
            version,
            get_message: Arc::new(EventRawLookup {
                events: self.inner.events.clone(),
                device_id,
            }),
            print_qr: false,
        };

        self.inner
            .transport
            .connect(opts)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))
    }

    /// Tear a session down and settle the device OFFLINE. Safe to call on
    /// unknown devices.
    pub async fn disconnect(&self, device_id: Uuid) -> Result<(), AppError> {
        if let Some(entry) = self.inner.sessions.get(&device_id) {
            entry.closing.store(true, Ordering::SeqCst);
        }

        if let Some((_, entry)) = self.inner.sessions.remove(&device_id) {
            self.inner.presence.clear_device(&device_id);
            entry.socket.end().await;
            info!(device_id = %device_id, "session disconnected");
        }

        match self
            .inner
            .devices
            .set_state(&device_id, DeviceStatus::Offline, Some(None), None)
            .await
        {
            Ok(()) => Ok(()),
            Err(AppError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The outbound path's socket lookup.
    pub fn get(&self, device_id: &Uuid) -> Option<Arc<dyn ChatSocket>> {
        self.inner
            .sessions
            .get(device_id)
            .map(|entry| entry.socket.clone())
    }

    pub fn live_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn auth_store(&self) -> &AuthStateStore {
        &self.inner.auth_store
    }

    /// Serial per-device event dispatch. Transport events for one device
    /// arrive in order on this channel; devices run concurrently.
    async fn run_device_loop(
        self,
        device_id: Uuid,
        tenant_id: Uuid,
        mut events: mpsc::Receiver<TransportEvent>,
        socket: Arc<dyn ChatSocket>,
        auth: Arc<AuthStateHandle>,
        closing: Arc<AtomicBool>,
    ) {
        'device: while let Some(event) = events.recv().await {
            match event {
                TransportEvent::CredsUpdated => {
                    auth.save();
                }
                TransportEvent::ConnectionUpdate(update) => {
                    if self
                        .handle_connection_update(device_id, update, &closing)
                        .await
                    {
                        break 'device;
                    }
                }
                TransportEvent::MessagesUpsert {
                    upsert_type: UpsertType::Notify,
                    messages,
                } => {
                    for raw in messages {
                        match self
                            .inner
                            .pipeline
                            .process(&socket, device_id, tenant_id, raw)
                            .await
                        {
                            Ok(Some(signal)) => {
                                self.handle_reconcile(device_id, &auth, &socket, signal, &closing)
                                    .await;
                                break 'device;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                // Annotate and keep the session; only a
                                // transport close kills it.
                                let message = e.to_string();
                                if crate::ops::is_session_sync_error(&message) {
                                    // Reconciliation happens through the stub
                                    // path on the next message.
                                    self.inner.db_log.warn(
                                        "Session sync incident in inbound handler",
                                        Some(serde_json::json!({ "error": message })),
                                        Some(device_id),
                                    );
                                } else {
                                    warn!(device_id = %device_id, error = %message, "inbound handler failed");
                                }
                                let _ = self
                                    .inner
                                    .devices
                                    .set_last_error(&device_id, &message)
                                    .await;
                            }
                        }
                    }
                }
                TransportEvent::MessagesUpsert { .. } => {
                    // History/append batches are not inbound traffic.
                }
            }
        }

        // Stream ended without a close event (transport dropped). Clean up the
        // registry unless a close/disconnect already did.
        if !closing.load(Ordering::SeqCst) && self.inner.sessions.remove(&device_id).is_some() {
            warn!(device_id = %device_id, "event stream ended without close, cleaning up entry");
            self.inner.presence.clear_device(&device_id);
            let _ = self
                .inner
                .devices
                .set_state(&device_id, DeviceStatus::Offline, Some(None), None)
                .await;
        }
    }

    /// Returns true when the session is over and the loop must stop.
    async fn handle_connection_update(
        &self,
        device_id: Uuid,
        update: ConnectionUpdate,
        closing: &Arc<AtomicBool>,
    ) -> bool {
        if let Some(qr) = &update.qr {
            debug!(device_id = %device_id, "pairing code received");
            if let Err(e) = self.inner.devices.set_qr(&device_id, qr).await {
                warn!(device_id = %device_id, error = %e, "failed to store QR");
            }
        }

        match update.connection {
            Some(ConnectionState::Connecting) => {
                let _ = self
                    .inner
                    .devices
                    .set_state(&device_id, DeviceStatus::Offline, None, Some(None))
                    .await;
                false
            }
            Some(ConnectionState::Open) => {
                if let Err(e) = self.inner.devices.set_online(&device_id).await {
                    warn!(device_id = %device_id, error = %e, "failed to mark device online");
                }
                // A paired device never keeps an exposed QR link.
                match self.inner.qr_links.expire_active_for_device(&device_id).await {
                    Ok(expired) if expired > 0 => {
                        info!(device_id = %device_id, expired = expired, "expired public QR links on open");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "failed to expire QR links");
                    }
                }
                info!(device_id = %device_id, "session online");
                false
            }
            Some(ConnectionState::Close) => {
                let reason = update
                    .last_disconnect
                    .map(|d| d.reason)
                    .unwrap_or_else(|| DisconnectReason::Closed("connection closed".to_string()));
                self.handle_close(device_id, reason, closing).await;
                true
            }
            None => false,
        }
    }

    async fn handle_close(
        &self,
        device_id: Uuid,
        reason: DisconnectReason,
        closing: &Arc<AtomicBool>,
    ) {
        let detail = reason.detail();
        let was_closing = closing.load(Ordering::SeqCst);

        self.inner.sessions.remove(&device_id);
        self.inner.presence.clear_device(&device_id);

        let _ = self
            .inner
            .devices
            .set_state(
                &device_id,
                DeviceStatus::Offline,
                Some(None),
                Some(Some(detail.as_str())),
            )
            .await;

        match reason {
            DisconnectReason::LoggedOut => {
                info!(device_id = %device_id, "peer logged out, not reconnecting");
                self.inner.db_log.warn(
                    "Device logged out by peer",
                    None,
                    Some(device_id),
                );
            }
            DisconnectReason::Closed(_) if was_closing => {
                debug!(device_id = %device_id, "close during explicit disconnect");
            }
            DisconnectReason::Closed(detail) => {
                if crate::ops::is_benign_transport_error(&detail) {
                    debug!(device_id = %device_id, detail = %detail, "transport noise close, reconnecting in {:?}", RECONNECT_DELAY);
                } else {
                    info!(device_id = %device_id, detail = %detail, "connection closed, reconnecting in {:?}", RECONNECT_DELAY);
                }
                self.schedule_connect(device_id, RECONNECT_DELAY);
            }
        }
    }

    /// Decryption-stub reconcile: evict the peer's key material, flush, and
    /// recycle the socket so the transport rebuilds sessions on reconnect.
    async fn handle_reconcile(
        &self,
        device_id: Uuid,
        auth: &Arc<AuthStateHandle>,
        socket: &Arc<dyn ChatSocket>,
        signal: ReconcileSignal,
        closing: &Arc<AtomicBool>,
    ) {
        warn!(
            device_id = %device_id,
            remote_jid = %signal.remote_jid,
            "decryption failure reported, evicting sender keys and recycling session"
        );
        self.inner.db_log.warn(
            "Session desync, reconciling sender keys",
            Some(serde_json::json!({ "remoteJid": signal.remote_jid })),
            Some(device_id),
        );

        let mut jids = vec![signal.remote_jid.clone()];
        if let Some(pn) = &signal.sender_pn {
            jids.push(pn.clone());
        }

        auth.clear_sender_in_memory(&jids).await;
        auth.save_now().await;

        closing.store(true, Ordering::SeqCst);
        self.inner.sessions.remove(&device_id);
        self.inner.presence.clear_device(&device_id);
        socket.end().await;

        let annotation = format!("session_desync: {}", signal.remote_jid);
        let _ = self
            .inner
            .devices
            .set_state(
                &device_id,
                DeviceStatus::Offline,
                Some(None),
                Some(Some(annotation.as_str())),
            )
            .await;

        self.schedule_connect(device_id, RECONCILE_RECONNECT_DELAY);
    }

    fn schedule_connect(&self, device_id: Uuid, delay: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = manager.connect(device_id).await {
                warn!(device_id = %device_id, error = %e, "scheduled reconnect failed");
            }
        });
    }
}

/// The transport's `getMessage` callback, backed by recent event rows.
struct EventRawLookup {
    events: EventRepository,
    device_id: Uuid,
}

#[async_trait]
impl GetMessageLookup for EventRawLookup {
    async fn get_message(&self, key: &MessageKey) -> Option<JsonValue> {
        match self
            .events
            .find_raw_message(&self.device_id, &key.id, &key.remote_jid)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                log::debug!("getMessage lookup failed for {}: {}", key.id, e);
                None
            }
        }
    }
}
