use crate::db::WaSessionRepository;
use crate::error::AppError;
use crate::normalizer::user_part;
use crate::security::Vault;
use crate::transport::{KeyBucket, KeyUpdates, SignalKeyStore};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

const SAVE_DEBOUNCE: Duration = Duration::from_secs(2);

type Buckets = HashMap<KeyBucket, HashMap<String, Vec<u8>>>;

/// On-disk JSON shape, encrypted as a whole by the vault. Blobs are base64 so
/// the state stays a plain JSON document.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedAuthState {
    creds: JsonValue,
    keys: HashMap<String, HashMap<String, String>>,
}

struct AuthStateInner {
    creds: JsonValue,
    keys: Buckets,
}

/// Backs the transport's authentication-state abstraction with one durable,
/// encrypted row per device. Key rotation is chatty, so `save` debounces with
/// a trailing timer while `save_now` flushes immediately.
#[derive(Clone)]
pub struct AuthStateStore {
    repo: WaSessionRepository,
    vault: Vault,
}

impl AuthStateStore {
    pub fn new(repo: WaSessionRepository, vault: Vault) -> Self {
        Self { repo, vault }
    }

    /// Read, decrypt and parse the device's state. An undecipherable row is
    /// deleted (forcing a fresh pairing); a readable row with corrupt key
    /// blobs keeps its credentials but has its Signal session buckets cleared
    /// and re-persisted.
    pub async fn load(&self, device_id: Uuid) -> Arc<AuthStateHandle> {
        let mut corrupted = false;
        let inner = match self.repo.load(&device_id).await {
            Ok(Some(row)) => match decode_state(&self.vault, &row.auth_state_enc) {
                Ok((inner, bad_blobs)) => {
                    corrupted = bad_blobs;
                    inner
                }
                Err(e) => {
                    log::warn!(
                        "Auth state for device {} is undecipherable ({}); deleting the row for a fresh pairing",
                        device_id,
                        e
                    );
                    if let Err(delete_err) = self.repo.delete(&device_id).await {
                        log::warn!(
                            "Failed to delete undecipherable auth state for {}: {}",
                            device_id,
                            delete_err
                        );
                    }
                    fresh_state()
                }
            },
            Ok(None) => fresh_state(),
            Err(e) => {
                log::warn!(
                    "Failed to load auth state for device {} ({}); starting fresh pairing",
                    device_id,
                    e
                );
                fresh_state()
            }
        };

        let handle = Arc::new(AuthStateHandle {
            device_id,
            repo: self.repo.clone(),
            vault: self.vault.clone(),
            state: Arc::new(Mutex::new(inner)),
            pending_save: Arc::new(StdMutex::new(None)),
        });

        if corrupted {
            // An undecodable blob poisons the Signal session state as a
            // whole; keep the creds, drop the session buckets, persist the
            // cleaned document.
            log::warn!(
                "Auth state for device {} carried corrupt key blobs; clearing session buckets",
                device_id
            );
            handle.clear_corrupted().await;
        }

        handle
    }

    /// Out-of-band purge of sender sessions, rewriting the persisted row
    /// directly. Used by the `reset-sender-sessions` command; live sessions go
    /// through `AuthStateHandle::clear_sender_in_memory` instead.
    pub async fn clear_sessions_for_jids(
        &self,
        device_id: &Uuid,
        jids: &[String],
    ) -> Result<(), AppError> {
        let row = match self.repo.load(device_id).await? {
            Some(row) => row,
            None => return Ok(()),
        };

        let (mut inner, _) = decode_state(&self.vault, &row.auth_state_enc)?;

        purge_sender_entries(&mut inner.keys, jids);

        let token = encode_state(&self.vault, &inner)?;
        self.repo.upsert(device_id, &token).await
    }
}

/// Live handle over one device's credentials and key buckets. The session
/// manager hands out at most one per device, which serializes saves.
pub struct AuthStateHandle {
    device_id: Uuid,
    repo: WaSessionRepository,
    vault: Vault,
    state: Arc<Mutex<AuthStateInner>>,
    pending_save: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl AuthStateHandle {
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub async fn creds(&self) -> JsonValue {
        self.state.lock().await.creds.clone()
    }

    pub async fn set_creds(&self, creds: JsonValue) {
        self.state.lock().await.creds = creds;
        self.save();
    }

    /// Schedule a trailing save. A later `save` or `save_now` supersedes the
    /// pending timer.
    pub fn save(&self) {
        let repo = self.repo.clone();
        let vault = self.vault.clone();
        let state = self.state.clone();
        let device_id = self.device_id;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            persist(&repo, &vault, device_id, &state).await;
        });

        let mut pending = self.pending_save.lock().unwrap();
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    /// Flush immediately and cancel any pending timer.
    pub async fn save_now(&self) {
        if let Some(previous) = self.pending_save.lock().unwrap().take() {
            previous.abort();
        }
        persist(&self.repo, &self.vault, self.device_id, &self.state).await;
    }

    /// Drop every entry that participates in Signal session state, then flush.
    pub async fn clear_corrupted(&self) {
        {
            let mut inner = self.state.lock().await;
            for bucket in [
                KeyBucket::Session,
                KeyBucket::SenderKey,
                KeyBucket::SenderKeyMemory,
            ] {
                inner.keys.remove(&bucket);
            }
        }
        self.save_now().await;
    }

    /// Evict the in-memory session and sender-key material of the given peers.
    /// The caller follows up with `save_now` and a socket teardown.
    pub async fn clear_sender_in_memory(&self, jids: &[String]) {
        let mut inner = self.state.lock().await;
        purge_sender_entries(&mut inner.keys, jids);
    }
}

#[async_trait]
impl SignalKeyStore for AuthStateHandle {
    async fn get(&self, bucket: KeyBucket, ids: &[String]) -> HashMap<String, Vec<u8>> {
        let inner = self.state.lock().await;
        let Some(entries) = inner.keys.get(&bucket) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| entries.get(id).map(|blob| (id.clone(), blob.clone())))
            .collect()
    }

    async fn set(&self, updates: KeyUpdates) {
        let mut changed = false;
        {
            let mut inner = self.state.lock().await;
            for (bucket, entries) in updates {
                let bucket_map = inner.keys.entry(bucket).or_default();
                for (id, blob) in entries {
                    match blob {
                        Some(blob) => {
                            if bucket_map.get(&id) != Some(&blob) {
                                bucket_map.insert(id, blob);
                                changed = true;
                            }
                        }
                        None => {
                            if bucket_map.remove(&id).is_some() {
                                changed = true;
                            }
                        }
                    }
                }
            }
        }
        if changed {
            self.save();
        }
    }
}

/// Purge by address: exact, `:`-suffixed and `.`-suffixed session ids of each
/// user part, plus any sender-key entry whose key mentions the user part.
fn purge_sender_entries(keys: &mut Buckets, jids: &[String]) {
    let user_parts: Vec<String> = jids
        .iter()
        .filter(|jid| !jid.is_empty())
        .map(|jid| user_part(jid).to_string())
        .filter(|part| !part.is_empty())
        .collect();

    if user_parts.is_empty() {
        return;
    }

    if let Some(sessions) = keys.get_mut(&KeyBucket::Session) {
        sessions.retain(|id, _| {
            !user_parts.iter().any(|part| {
                id == part
                    || id.starts_with(&format!("{}:", part))
                    || id.starts_with(&format!("{}.", part))
            })
        });
    }

    for bucket in [KeyBucket::SenderKey, KeyBucket::SenderKeyMemory] {
        if let Some(entries) = keys.get_mut(&bucket) {
            entries.retain(|id, _| !user_parts.iter().any(|part| id.contains(part.as_str())));
        }
    }
}

async fn persist(
    repo: &WaSessionRepository,
    vault: &Vault,
    device_id: Uuid,
    state: &Arc<Mutex<AuthStateInner>>,
) {
    let token = {
        let inner = state.lock().await;
        match encode_state(vault, &inner) {
            Ok(token) => token,
            Err(e) => {
                log::error!("Failed to encode auth state for device {}: {}", device_id, e);
                return;
            }
        }
    };

    // Best-effort: a failed save must not take the session down.
    if let Err(e) = repo.upsert(&device_id, &token).await {
        log::error!("Failed to persist auth state for device {}: {}", device_id, e);
    }
}

fn encode_state(vault: &Vault, inner: &AuthStateInner) -> Result<String, AppError> {
    let mut keys: HashMap<String, HashMap<String, String>> = HashMap::new();
    for (bucket, entries) in &inner.keys {
        let encoded: HashMap<String, String> = entries
            .iter()
            .map(|(id, blob)| (id.clone(), B64.encode(blob)))
            .collect();
        keys.insert(bucket.as_str().to_string(), encoded);
    }

    let persisted = PersistedAuthState {
        creds: inner.creds.clone(),
        keys,
    };

    let plaintext = serde_json::to_vec(&persisted)?;
    vault
        .encrypt(&plaintext)
        .map_err(|e| AppError::Crypto(e.to_string()))
}

/// Decode a persisted token. The second value reports corrupt key blobs:
/// those entries are skipped, and the caller follows up with
/// `clear_corrupted` so partial Signal state never reaches the transport.
fn decode_state(vault: &Vault, token: &str) -> Result<(AuthStateInner, bool), AppError> {
    let plaintext = vault
        .decrypt(token)
        .map_err(|e| AppError::Crypto(e.to_string()))?;
    let persisted: PersistedAuthState = serde_json::from_slice(&plaintext)?;

    let mut corrupted = false;
    let mut keys: Buckets = HashMap::new();
    for (bucket_name, entries) in persisted.keys {
        let Some(bucket) = KeyBucket::parse(&bucket_name) else {
            log::warn!("Dropping unknown key bucket '{}' from auth state", bucket_name);
            continue;
        };
        let decoded = keys.entry(bucket).or_default();
        for (id, blob_b64) in entries {
            match B64.decode(&blob_b64) {
                Ok(blob) => {
                    decoded.insert(id, blob);
                }
                Err(_) => {
                    log::warn!(
                        "Corrupt key blob '{}' in bucket '{}', skipping",
                        id,
                        bucket_name
                    );
                    corrupted = true;
                }
            }
        }
    }

    Ok((
        AuthStateInner {
            creds: persisted.creds,
            keys,
        },
        corrupted,
    ))
}

/// Fresh credentials for an unpaired device. Opaque to the engine; the
/// transport fills in the rest during pairing.
fn fresh_state() -> AuthStateInner {
    let mut noise = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut noise);
    let registration_id = (rand::thread_rng().next_u32() % 16_380) + 1;

    AuthStateInner {
        creds: serde_json::json!({
            "registrationId": registration_id,
            "advSecretB64": B64.encode(noise),
            "registered": false,
        }),
        keys: HashMap::new(),
    }
}
