use crate::transport::{ChatSocket, Presence};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pending "paused" presence timers, one per (device, chat). An inbound
/// schedules one; an outbound send to the same chat supersedes it.
#[derive(Clone)]
pub struct PresenceScheduler {
    timers: Arc<DashMap<(Uuid, String), tokio::task::JoinHandle<()>>>,
}

impl PresenceScheduler {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
        }
    }

    pub fn schedule_paused(
        &self,
        socket: Arc<dyn ChatSocket>,
        device_id: Uuid,
        jid: &str,
        delay: Duration,
    ) {
        let key = (device_id, jid.to_string());
        let timers = self.timers.clone();
        let task_key = key.clone();
        let target = jid.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = socket.send_presence_update(Presence::Paused, &target).await {
                log::debug!("Paused presence to {} failed: {}", target, e);
            }
            timers.remove(&task_key);
        });

        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }
    }

    pub fn supersede(&self, device_id: &Uuid, jid: &str) {
        if let Some((_, handle)) = self.timers.remove(&(*device_id, jid.to_string())) {
            handle.abort();
        }
    }

    /// Drop every timer of a device, e.g. on disconnect.
    pub fn clear_device(&self, device_id: &Uuid) {
        self.timers.retain(|(device, _), handle| {
            if device == device_id {
                handle.abort();
                false
            } else {
                true
            }
        });
    }
}

impl Default for PresenceScheduler {
    fn default() -> Self {
        Self::new()
    }
}
