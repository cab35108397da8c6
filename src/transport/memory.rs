use crate::transport::{
    ChatSession, ChatSocket, ChatTransport, ConnectOptions, ConnectionState, ConnectionUpdate,
    DisconnectInfo, DisconnectReason, MessageKey, OutgoingMessage, Presence, ProtocolVersion,
    SentMessage, TransportError, TransportEvent,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// What the next `connect` for a device should do.
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    /// Fail the socket construction with this message.
    pub connect_error: Option<String>,
    /// Own address reported once authenticated.
    pub user: Option<String>,
    /// Events fed into the session right after construction.
    pub initial_events: Vec<TransportEvent>,
}

impl SessionScript {
    /// A session that authenticates and opens immediately.
    pub fn open(user: &str) -> Self {
        Self {
            connect_error: None,
            user: Some(user.to_string()),
            initial_events: vec![TransportEvent::ConnectionUpdate(ConnectionUpdate {
                connection: Some(ConnectionState::Open),
                ..Default::default()
            })],
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            connect_error: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// In-process transport used by the test-suite and `CHAT_TRANSPORT=memory`
/// development runs. Sessions are scripted per device; tests can keep feeding
/// events into a live session through `emit`.
pub struct MemoryTransport {
    scripts: DashMap<Uuid, VecDeque<SessionScript>>,
    live: DashMap<Uuid, LiveSession>,
}

struct LiveSession {
    tx: mpsc::Sender<TransportEvent>,
    socket: Arc<MemorySocket>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            scripts: DashMap::new(),
            live: DashMap::new(),
        }
    }

    /// Queue a script for the device's next connect. Scripts are consumed in
    /// FIFO order; an unscripted connect gets `SessionScript::open`.
    pub fn script_session(&self, device_id: Uuid, script: SessionScript) {
        self.scripts
            .entry(device_id)
            .or_insert_with(VecDeque::new)
            .push_back(script);
    }

    /// Feed an event into the device's live session. Returns false when no
    /// session is live or the consumer is gone.
    pub async fn emit(&self, device_id: &Uuid, event: TransportEvent) -> bool {
        let tx = match self.live.get(device_id) {
            Some(entry) => entry.tx.clone(),
            None => return false,
        };
        tx.send(event).await.is_ok()
    }

    /// The live socket for assertions on recorded commands.
    pub fn socket(&self, device_id: &Uuid) -> Option<Arc<MemorySocket>> {
        self.live.get(device_id).map(|entry| entry.socket.clone())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    async fn fetch_protocol_version(&self) -> Result<ProtocolVersion, TransportError> {
        Ok([2, 3000, 0])
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<ChatSession, TransportError> {
        let script = self
            .scripts
            .get_mut(&opts.device_id)
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| SessionScript::open("memory-device@s.whatsapp.net"));

        if let Some(message) = script.connect_error {
            return Err(TransportError::ConnectFailed(message));
        }

        let (tx, rx) = mpsc::channel(128);

        let socket = Arc::new(MemorySocket {
            user: RwLock::new(script.user),
            sent: Mutex::new(Vec::new()),
            presences: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
            tx: tx.clone(),
        });

        for event in script.initial_events {
            let _ = tx.send(event).await;
        }

        self.live.insert(
            opts.device_id,
            LiveSession {
                tx,
                socket: socket.clone(),
            },
        );

        Ok(ChatSession {
            socket,
            events: rx,
        })
    }
}

pub struct MemorySocket {
    user: RwLock<Option<String>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub presences: Mutex<Vec<(Presence, String)>>,
    pub reads: Mutex<Vec<MessageKey>>,
    ended: AtomicBool,
    tx: mpsc::Sender<TransportEvent>,
}

impl MemorySocket {
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn set_user(&self, user: Option<String>) {
        *self.user.write().unwrap() = user;
    }
}

#[async_trait]
impl ChatSocket for MemorySocket {
    fn authenticated_user(&self) -> Option<String> {
        self.user.read().unwrap().clone()
    }

    async fn send_message(
        &self,
        to: &str,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, TransportError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), message.text.clone()));
        Ok(SentMessage {
            id: format!("mem-{}", Uuid::new_v4()),
        })
    }

    async fn send_presence_update(
        &self,
        presence: Presence,
        jid: &str,
    ) -> Result<(), TransportError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.presences
            .lock()
            .unwrap()
            .push((presence, jid.to_string()));
        Ok(())
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), TransportError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.reads.lock().unwrap().extend_from_slice(keys);
        Ok(())
    }

    async fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        // Mirror the real transport: ending the socket surfaces one final
        // close on the event stream.
        let _ = self
            .tx
            .send(TransportEvent::ConnectionUpdate(ConnectionUpdate {
                connection: Some(ConnectionState::Close),
                last_disconnect: Some(DisconnectInfo {
                    reason: DisconnectReason::Closed("socket ended".to_string()),
                }),
                ..Default::default()
            }))
            .await;
    }
}
