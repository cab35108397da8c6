pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("socket is not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Wire envelope of one inbound message, shaped the way the upstream protocol
/// surfaces it. Kept serde-faithful so `raw_json` round-trips byte-for-byte
/// through the event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<MessageKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_stub_type: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_stub_parameters: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub id: String,
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_pn: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_text_message: Option<ExtendedTextMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_message: Option<MediaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_message: Option<MediaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_message: Option<MediaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_message: Option<MediaMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedTextMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Typed event stream consumed by the per-device session task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    CredsUpdated,
    ConnectionUpdate(ConnectionUpdate),
    MessagesUpsert {
        upsert_type: UpsertType,
        messages: Vec<RawMessage>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionState>,
    pub qr: Option<String>,
    pub last_disconnect: Option<DisconnectInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone)]
pub struct DisconnectInfo {
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer unlinked this device. Terminal: no automatic reconnect.
    LoggedOut,
    /// Any other close; the detail string is recorded on the device row.
    Closed(String),
}

impl DisconnectReason {
    pub fn detail(&self) -> String {
        match self {
            DisconnectReason::LoggedOut => "logged_out".to_string(),
            DisconnectReason::Closed(detail) => detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertType {
    Notify,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Composing,
    Paused,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Composing => "composing",
            Presence::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub text: String,
}

/// Provider acknowledgement of a sent message.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: String,
}

/// Key-bucket kinds of the transport's authentication-state abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyBucket {
    Session,
    SenderKey,
    SenderKeyMemory,
    PreKey,
    AppStateSyncKey,
}

impl KeyBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyBucket::Session => "session",
            KeyBucket::SenderKey => "sender-key",
            KeyBucket::SenderKeyMemory => "sender-key-memory",
            KeyBucket::PreKey => "pre-keys",
            KeyBucket::AppStateSyncKey => "app-state-sync-key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" | "sessions" => Some(KeyBucket::Session),
            "sender-key" => Some(KeyBucket::SenderKey),
            "sender-key-memory" => Some(KeyBucket::SenderKeyMemory),
            "pre-keys" => Some(KeyBucket::PreKey),
            "app-state-sync-key" => Some(KeyBucket::AppStateSyncKey),
            _ => None,
        }
    }
}

/// `(bucket, id) -> Some(blob)` upserts, `None` deletes.
pub type KeyUpdates = HashMap<KeyBucket, HashMap<String, Option<Vec<u8>>>>;

/// The key-store facade the transport requires from its auth state.
#[async_trait]
pub trait SignalKeyStore: Send + Sync {
    async fn get(&self, bucket: KeyBucket, ids: &[String]) -> HashMap<String, Vec<u8>>;
    async fn set(&self, updates: KeyUpdates);
}

/// Lookup the transport uses to recover previously observed envelopes.
#[async_trait]
pub trait GetMessageLookup: Send + Sync {
    async fn get_message(&self, key: &MessageKey) -> Option<JsonValue>;
}

pub type ProtocolVersion = [u32; 3];

pub struct ConnectOptions {
    pub device_id: Uuid,
    pub creds: JsonValue,
    pub keys: Arc<dyn SignalKeyStore>,
    pub version: ProtocolVersion,
    pub get_message: Arc<dyn GetMessageLookup>,
    /// QR is propagated through device rows, never printed by the transport.
    pub print_qr: bool,
}

/// A live connection: a command surface plus the serial event stream for the
/// owning per-device task.
pub struct ChatSession {
    pub socket: Arc<dyn ChatSocket>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait ChatSocket: Send + Sync {
    /// The authenticated own address, once the session is open.
    fn authenticated_user(&self) -> Option<String>;

    async fn send_message(
        &self,
        to: &str,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, TransportError>;

    async fn send_presence_update(
        &self,
        presence: Presence,
        jid: &str,
    ) -> Result<(), TransportError>;

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), TransportError>;

    async fn end(&self);
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Current protocol version pair; the session manager caches this lazily.
    async fn fetch_protocol_version(&self) -> Result<ProtocolVersion, TransportError>;

    async fn connect(&self, opts: ConnectOptions) -> Result<ChatSession, TransportError>;
}
