use std::time::Duration;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic liveness line so log pipelines can tell a quiet worker from a
/// dead one.
pub fn spawn_heartbeat(live_sessions: impl Fn() -> usize + Send + 'static) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            log::info!("worker heartbeat, live_sessions={}", live_sessions());
        }
    })
}
