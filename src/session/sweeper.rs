use crate::db::DeviceRepository;
use crate::error::AppError;
use crate::session::manager::SessionManager;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Reconnect every device that has persisted auth, spacing the connects so a
/// deploy does not stampede the transport. Failures are logged and do not
/// abort the sweep.
pub async fn run_reconnect_sweep<F, Fut>(
    device_ids: Vec<Uuid>,
    startup_delay: Duration,
    stagger: Duration,
    connect: F,
) where
    F: Fn(Uuid) -> Fut,
    Fut: Future<Output = Result<(), AppError>>,
{
    tokio::time::sleep(startup_delay).await;

    log::info!(
        "Reconnect sweep starting for {} devices (stagger {:?})",
        device_ids.len(),
        stagger
    );

    for (index, device_id) in device_ids.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(stagger).await;
        }
        if let Err(e) = connect(*device_id).await {
            log::warn!("Reconnect sweep: connect failed for {}: {}", device_id, e);
        }
    }

    log::info!("Reconnect sweep finished");
}

pub fn spawn_reconnect_sweeper(
    manager: SessionManager,
    devices: DeviceRepository,
    startup_delay: Duration,
    stagger: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let device_ids = match devices.list_ids_with_session().await {
            Ok(ids) => ids,
            Err(e) => {
                log::error!("Reconnect sweep aborted, device listing failed: {}", e);
                return;
            }
        };

        let manager = manager.clone();
        run_reconnect_sweep(device_ids, startup_delay, stagger, move |device_id| {
            let manager = manager.clone();
            async move { manager.connect(device_id).await }
        })
        .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn sweep_staggers_connects_and_survives_failures() {
        let devices: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let failing = devices[1];
        let observed: Arc<Mutex<Vec<(Uuid, Duration)>>> = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        {
            let observed = observed.clone();
            run_reconnect_sweep(
                devices.clone(),
                Duration::from_millis(50),
                Duration::from_millis(100),
                move |device_id| {
                    let observed = observed.clone();
                    async move {
                        observed
                            .lock()
                            .unwrap()
                            .push((device_id, started.elapsed()));
                        if device_id == failing {
                            Err(AppError::Transport("connect refused".to_string()))
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await;
        }

        let calls = observed.lock().unwrap();
        assert_eq!(calls.len(), 3, "a failing device must not stop the sweep");
        assert_eq!(calls[0].0, devices[0]);
        assert_eq!(calls[1].0, devices[1]);
        assert_eq!(calls[2].0, devices[2]);
        assert_eq!(calls[0].1, Duration::from_millis(50));
        assert_eq!(calls[1].1, Duration::from_millis(150));
        assert_eq!(calls[2].1, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_fleet_sweeps_instantly() {
        run_reconnect_sweep(
            Vec::new(),
            Duration::from_millis(5),
            Duration::from_millis(5),
            |_| async { Ok(()) },
        )
        .await;
    }
}
