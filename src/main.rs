use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;

use wagate_worker::config::{AlertConfig, WorkerSettings};
use wagate_worker::db::{
    self, DeviceRepository, EventRepository, LogRepository, OutboundMessageRepository,
    PublicQrLinkRepository, WaSessionRepository, WebhookDeliveryRepository,
    WebhookEndpointRepository,
};
use wagate_worker::dispatch::{DeviceCommandHandler, OutboundDispatcher, WebhookDispatcher};
use wagate_worker::inbound::InboundPipeline;
use wagate_worker::ops::{self, AdminAlerting, DbLogSink};
use wagate_worker::queue::{self, QueueRuntime};
use wagate_worker::security::Vault;
use wagate_worker::session::{
    sweeper::spawn_reconnect_sweeper, AuthStateStore, PresenceScheduler, SessionManager,
};
use wagate_worker::transport::memory::MemoryTransport;
use wagate_worker::transport::ChatTransport;

const DEVICE_COMMANDS_CONCURRENCY: usize = 1;
const OUTBOUND_CONCURRENCY: usize = 5;
const WEBHOOK_CONCURRENCY: usize = 10;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let settings = match WorkerSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Failed to load worker settings from environment: {}", e);
            log::error!("Cannot start worker without valid settings");
            std::process::exit(1);
        }
    };

    // The vault key is load-bearing for every session blob; refuse to start
    // without it rather than failing on the first device.
    let vault = match Vault::new(&settings.vault.key) {
        Ok(vault) => vault,
        Err(e) => {
            log::error!("Vault key rejected: {}", e);
            std::process::exit(1);
        }
    };

    let db_pool = match db::create_pool(&settings.database.url).await {
        Ok(pool) => {
            if let Err(e) = db::verify_connection(&pool).await {
                log::error!("Database connection verification failed: {}", e);
                std::process::exit(1);
            }
            pool
        }
        Err(e) => {
            log::error!("Failed to create database connection pool: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = sqlx::migrate!("./migrations").run(&db_pool).await {
        log::error!("Database migration failed: {}", e);
        std::process::exit(1);
    }
    log::info!("Database connection established and migrations applied");

    let queues = match QueueRuntime::connect(&settings.redis.url).await {
        Ok(queues) => queues,
        Err(e) => {
            log::error!("Failed to connect to the queue broker: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Queue broker connection established");

    let devices = DeviceRepository::new(db_pool.clone());
    let events = EventRepository::new(db_pool.clone());
    let endpoints = WebhookEndpointRepository::new(db_pool.clone());
    let deliveries = WebhookDeliveryRepository::new(db_pool.clone());
    let outbound = OutboundMessageRepository::new(db_pool.clone());
    let qr_links = PublicQrLinkRepository::new(db_pool.clone());
    let wa_sessions = WaSessionRepository::new(db_pool.clone());
    let logs = LogRepository::new(db_pool.clone());

    let db_log = DbLogSink::new(logs);
    let presence = PresenceScheduler::new();
    let auth_store = AuthStateStore::new(wa_sessions, vault);

    let transport: Arc<dyn ChatTransport> = match settings.transport.kind.as_str() {
        "memory" => {
            log::warn!("CHAT_TRANSPORT=memory: running with the in-process transport");
            Arc::new(MemoryTransport::new())
        }
        other => {
            // Production transports are linked by the deployment build and
            // registered here; this binary only carries the dev transport.
            log::error!("Unknown CHAT_TRANSPORT '{}' (supported: memory)", other);
            std::process::exit(1);
        }
    };

    let pipeline = InboundPipeline::new(
        db_pool.clone(),
        devices.clone(),
        events.clone(),
        endpoints,
        deliveries.clone(),
        outbound.clone(),
        queues.clone(),
        presence.clone(),
        db_log.clone(),
        settings.inbound.ack_message.clone(),
    );

    let manager = SessionManager::new(
        transport,
        auth_store,
        devices.clone(),
        events,
        qr_links,
        pipeline,
        presence.clone(),
        db_log.clone(),
    );

    let commands_consumer = queues.spawn_consumer(
        queue::DEVICE_COMMANDS,
        DEVICE_COMMANDS_CONCURRENCY,
        Arc::new(DeviceCommandHandler::new(manager.clone())),
    );

    let outbound_consumer = queues.spawn_consumer(
        queue::OUTBOUND_MESSAGES,
        OUTBOUND_CONCURRENCY,
        Arc::new(OutboundDispatcher::new(
            outbound,
            devices.clone(),
            manager.clone(),
            presence,
            db_log.clone(),
            settings.outbound.composing_before_send_ms,
        )),
    );

    let webhook_consumer = queues.spawn_consumer(
        queue::WEBHOOK_DISPATCH,
        WEBHOOK_CONCURRENCY,
        Arc::new(WebhookDispatcher::new(deliveries.clone())),
    );

    // Picks up deliveries whose enqueue failed after the fan-out committed.
    let _delivery_recovery =
        wagate_worker::dispatch::webhook::spawn_delivery_recovery(deliveries, queues.clone());

    let _heartbeat = {
        let manager = manager.clone();
        ops::heartbeat::spawn_heartbeat(move || manager.live_count())
    };

    let _sweeper = spawn_reconnect_sweeper(
        manager.clone(),
        devices,
        Duration::from_millis(settings.reconnect.all_delay_ms),
        Duration::from_millis(settings.reconnect.stagger_ms),
    );

    let alerting = AdminAlerting::new(AlertConfig::from_env());
    let health = ops::health::health_server(settings.server.health_port)?;

    log::info!("Worker started");

    // Every arm below is a subsystem that must never finish on its own; any
    // completion is an unclassified fault and the supervisor restarts us.
    let fault: String = tokio::select! {
        result = health => format!("health server exited: {:?}", result),
        result = commands_consumer => format!("device_commands consumer exited: {:?}", result),
        result = outbound_consumer => format!("outbound_messages consumer exited: {:?}", result),
        result = webhook_consumer => format!("webhook_dispatch consumer exited: {:?}", result),
    };

    db_log.error("Worker subsystem died, exiting", Some(fault.as_str()), None, None);
    alerting
        .send_crash_alert("wagate worker crashed", &fault)
        .await;

    std::process::exit(1);
}
