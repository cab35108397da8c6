use crate::db::LogRepository;
use crate::models::LogLevel;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Console logging plus a persisted trail for the levels operators care
/// about. Rows are written fire-and-forget; the log table is diagnostics, not
/// state.
#[derive(Clone)]
pub struct DbLogSink {
    repo: LogRepository,
}

impl DbLogSink {
    pub fn new(repo: LogRepository) -> Self {
        Self { repo }
    }

    pub fn info(&self, message: &str, metadata: Option<JsonValue>, device_id: Option<Uuid>) {
        log::info!("{}", message);
        self.persist(LogLevel::Info, message, None, metadata, device_id);
    }

    pub fn warn(&self, message: &str, metadata: Option<JsonValue>, device_id: Option<Uuid>) {
        log::warn!("{}", message);
        self.persist(LogLevel::Warn, message, None, metadata, device_id);
    }

    pub fn error(
        &self,
        message: &str,
        error: Option<&str>,
        metadata: Option<JsonValue>,
        device_id: Option<Uuid>,
    ) {
        match error {
            Some(e) => log::error!("{}: {}", message, e),
            None => log::error!("{}", message),
        }
        self.persist(LogLevel::Error, message, error, metadata, device_id);
    }

    fn persist(
        &self,
        level: LogLevel,
        message: &str,
        error: Option<&str>,
        metadata: Option<JsonValue>,
        device_id: Option<Uuid>,
    ) {
        let repo = self.repo.clone();
        let message = message.to_string();
        let error = error.map(String::from);
        tokio::spawn(async move {
            repo.insert_best_effort(
                level,
                &message,
                error.as_deref(),
                metadata.as_ref(),
                device_id.as_ref(),
            )
            .await;
        });
    }
}
