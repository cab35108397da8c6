use crate::queue::{Job, JobHandler, JobOutcome};
use crate::session::SessionManager;
use async_trait::async_trait;
use uuid::Uuid;

/// Consumer of the `device_commands` queue. The control-plane produces
/// `connect`, `disconnect` and `reset-sender-sessions` jobs with a
/// `{deviceId, jids?}` payload; everything else is refused outright.
pub struct DeviceCommandHandler {
    manager: SessionManager,
}

impl DeviceCommandHandler {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    fn device_id(job: &Job) -> Option<Uuid> {
        job.payload
            .get("deviceId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    fn jids(job: &Job) -> Vec<String> {
        job.payload
            .get("jids")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobHandler for DeviceCommandHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let Some(device_id) = Self::device_id(job) else {
            return JobOutcome::Terminal(format!(
                "device command '{}' without a valid deviceId",
                job.name
            ));
        };

        match job.name.as_str() {
            "connect" => match self.manager.connect(device_id).await {
                Ok(()) => JobOutcome::Ok,
                Err(e) => JobOutcome::Retry(format!("connect {}: {}", device_id, e)),
            },
            "disconnect" => match self.manager.disconnect(device_id).await {
                Ok(()) => JobOutcome::Ok,
                Err(e) => JobOutcome::Retry(format!("disconnect {}: {}", device_id, e)),
            },
            "reset-sender-sessions" => {
                let jids = Self::jids(job);
                if jids.is_empty() {
                    return JobOutcome::Terminal(
                        "reset-sender-sessions without jids".to_string(),
                    );
                }

                // Tear down first so the rewrite never races a live save.
                if let Err(e) = self.manager.disconnect(device_id).await {
                    return JobOutcome::Retry(format!("reset {}: disconnect: {}", device_id, e));
                }
                if let Err(e) = self
                    .manager
                    .auth_store()
                    .clear_sessions_for_jids(&device_id, &jids)
                    .await
                {
                    return JobOutcome::Retry(format!("reset {}: purge: {}", device_id, e));
                }
                match self.manager.connect(device_id).await {
                    Ok(()) => JobOutcome::Ok,
                    Err(e) => JobOutcome::Retry(format!("reset {}: reconnect: {}", device_id, e)),
                }
            }
            other => JobOutcome::Terminal(format!("unknown device command '{}'", other)),
        }
    }
}
