//! End-to-end engine tests over the in-process transport. They only run when
//! DATABASE_URL and REDIS_URL are present in the environment, mirroring how
//! the other database-backed tests are guarded.

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use wagate_worker::db::{
    DeviceRepository, EventRepository, LogRepository, OutboundMessageRepository,
    PublicQrLinkRepository, WaSessionRepository, WebhookDeliveryRepository,
    WebhookEndpointRepository,
};
use wagate_worker::inbound::InboundPipeline;
use wagate_worker::ops::DbLogSink;
use wagate_worker::queue::QueueRuntime;
use wagate_worker::security::Vault;
use wagate_worker::session::{AuthStateStore, PresenceScheduler, SessionManager};
use wagate_worker::transport::memory::{MemoryTransport, SessionScript};
use wagate_worker::transport::{
    ChatTransport, ConnectionState, ConnectionUpdate, DisconnectInfo, DisconnectReason,
    MessageContent, MessageKey, Presence, RawMessage, TransportEvent, UpsertType,
};

struct TestCtx {
    pool: PgPool,
    transport: Arc<MemoryTransport>,
    manager: SessionManager,
    queues: QueueRuntime,
    tenant_id: Uuid,
    device_id: Uuid,
}

impl TestCtx {
    async fn try_new() -> Option<TestCtx> {
        let db_url = std::env::var("DATABASE_URL").ok()?;
        let redis_url = std::env::var("REDIS_URL").ok()?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .ok()?;
        sqlx::migrate!("./migrations").run(&pool).await.ok()?;

        let queues = QueueRuntime::connect(&redis_url).await.ok()?;

        let (tenant_id,): (Uuid,) =
            sqlx::query_as("INSERT INTO tenants (name) VALUES ('engine-test') RETURNING id")
                .fetch_one(&pool)
                .await
                .ok()?;
        let (device_id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO devices (tenant_id, label) VALUES ($1, 'engine-test-device') RETURNING id",
        )
        .bind(tenant_id)
        .fetch_one(&pool)
        .await
        .ok()?;

        let transport = Arc::new(MemoryTransport::new());
        let vault = Vault::new(&[3u8; 32]).unwrap();
        let presence = PresenceScheduler::new();
        let db_log = DbLogSink::new(LogRepository::new(pool.clone()));
        let auth_store = AuthStateStore::new(WaSessionRepository::new(pool.clone()), vault);

        let pipeline = InboundPipeline::new(
            pool.clone(),
            DeviceRepository::new(pool.clone()),
            EventRepository::new(pool.clone()),
            WebhookEndpointRepository::new(pool.clone()),
            WebhookDeliveryRepository::new(pool.clone()),
            OutboundMessageRepository::new(pool.clone()),
            queues.clone(),
            presence.clone(),
            db_log.clone(),
            None,
        );

        let chat_transport: Arc<dyn ChatTransport> = transport.clone();
        let manager = SessionManager::new(
            chat_transport,
            auth_store,
            DeviceRepository::new(pool.clone()),
            EventRepository::new(pool.clone()),
            PublicQrLinkRepository::new(pool.clone()),
            pipeline,
            presence,
            db_log,
        );

        Some(TestCtx {
            pool,
            transport,
            manager,
            queues,
            tenant_id,
            device_id,
        })
    }

    async fn add_endpoint(&self, enabled: bool) -> Uuid {
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO webhook_endpoints (tenant_id, url, secret, enabled)
             VALUES ($1, 'https://bots.example.com/hook', 'whsec_test', $2) RETURNING id",
        )
        .bind(self.tenant_id)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await
        .unwrap();
        id
    }

    async fn device_row(&self) -> (String, Option<String>) {
        sqlx::query_as("SELECT status, last_error FROM devices WHERE id = $1")
            .bind(self.device_id)
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..60 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn text_message(remote_jid: &str, text: &str) -> RawMessage {
    RawMessage {
        key: Some(MessageKey {
            id: format!("TEST{}", Uuid::new_v4().simple()),
            remote_jid: remote_jid.to_string(),
            from_me: false,
            participant: None,
            sender_pn: None,
        }),
        message: Some(MessageContent {
            conversation: Some(text.to_string()),
            ..Default::default()
        }),
        message_stub_type: None,
        message_stub_parameters: None,
        message_timestamp: Some(1_736_900_000),
    }
}

#[tokio::test]
async fn text_inbound_fans_out_to_enabled_endpoints_only() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };

    let enabled = ctx.add_endpoint(true).await;
    let _disabled = ctx.add_endpoint(false).await;

    ctx.transport
        .script_session(ctx.device_id, SessionScript::open("me@s.whatsapp.net"));
    ctx.manager.connect(ctx.device_id).await.unwrap();

    assert!(
        wait_until(|| async { ctx.device_row().await.0 == "ONLINE" }).await,
        "device must go ONLINE on the open event"
    );

    let sender = "5491122223333@s.whatsapp.net";
    assert!(
        ctx.transport
            .emit(
                &ctx.device_id,
                TransportEvent::MessagesUpsert {
                    upsert_type: UpsertType::Notify,
                    messages: vec![text_message(sender, "hola")],
                },
            )
            .await
    );

    assert!(
        wait_until(|| async {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM events WHERE device_id = $1")
                    .bind(ctx.device_id)
                    .fetch_one(&ctx.pool)
                    .await
                    .unwrap();
            count == 1
        })
        .await,
        "one event row per inbound message"
    );

    let (normalized,): (serde_json::Value,) =
        sqlx::query_as("SELECT normalized_json FROM events WHERE device_id = $1")
            .bind(ctx.device_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(normalized["content"]["type"], "text");
    assert_eq!(normalized["content"]["text"], "hola");
    assert!(normalized["content"]["media"].is_null());
    assert_eq!(normalized["from"], sender);

    let deliveries: Vec<(Uuid, String, i32)> = sqlx::query_as(
        "SELECT d.endpoint_id, d.status, d.attempts
         FROM webhook_deliveries d JOIN events e ON e.id = d.event_id
         WHERE e.device_id = $1",
    )
    .bind(ctx.device_id)
    .fetch_all(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(deliveries.len(), 1, "disabled endpoints get no delivery");
    assert_eq!(deliveries[0].0, enabled);
    assert_eq!(deliveries[0].1, "PENDING");
    assert_eq!(deliveries[0].2, 0);

    let socket = ctx.transport.socket(&ctx.device_id).unwrap();
    let presences = socket.presences.lock().unwrap().clone();
    assert!(presences.contains(&(Presence::Composing, sender.to_string())));
    assert_eq!(socket.reads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn connect_failure_marks_device_error() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };

    ctx.transport
        .script_session(ctx.device_id, SessionScript::failing("transport unavailable"));

    let result = ctx.manager.connect(ctx.device_id).await;
    assert!(result.is_err());

    let (status, last_error) = ctx.device_row().await;
    assert_eq!(status, "ERROR");
    assert!(last_error.unwrap().starts_with("connect_error:"));
    assert!(ctx.manager.get(&ctx.device_id).is_none());
}

#[tokio::test]
async fn connect_is_idempotent_per_device() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };

    ctx.transport
        .script_session(ctx.device_id, SessionScript::open("me@s.whatsapp.net"));
    ctx.manager.connect(ctx.device_id).await.unwrap();
    let first = ctx.manager.get(&ctx.device_id).unwrap();

    // No script queued for a second connect; a non-idempotent call would
    // consume the default script and replace the socket.
    ctx.manager.connect(ctx.device_id).await.unwrap();
    let second = ctx.manager.get(&ctx.device_id).unwrap();

    assert_eq!(ctx.manager.live_count(), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn decryption_stub_reconciles_and_recycles_the_socket() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };
    ctx.add_endpoint(true).await;

    ctx.transport
        .script_session(ctx.device_id, SessionScript::open("me@s.whatsapp.net"));
    ctx.manager.connect(ctx.device_id).await.unwrap();
    assert!(wait_until(|| async { ctx.device_row().await.0 == "ONLINE" }).await);

    let socket = ctx.transport.socket(&ctx.device_id).unwrap();

    let stub = RawMessage {
        key: Some(MessageKey {
            id: "STUB1".to_string(),
            remote_jid: "67229240574002@lid".to_string(),
            from_me: false,
            participant: None,
            sender_pn: Some("5491122223333@s.whatsapp.net".to_string()),
        }),
        message: None,
        message_stub_type: Some(2),
        message_stub_parameters: Some(vec![
            "No matching sessions found for message".to_string()
        ]),
        message_timestamp: Some(1_736_900_000),
    };
    ctx.transport
        .emit(
            &ctx.device_id,
            TransportEvent::MessagesUpsert {
                upsert_type: UpsertType::Notify,
                messages: vec![stub],
            },
        )
        .await;

    assert!(
        wait_until(|| async { socket.is_ended() }).await,
        "reconcile must tear the socket down"
    );
    assert!(
        wait_until(|| async { ctx.manager.get(&ctx.device_id).is_none() }).await,
        "reconcile must drop the registry entry"
    );

    let (normalized,): (serde_json::Value,) =
        sqlx::query_as("SELECT normalized_json FROM events WHERE device_id = $1")
            .bind(ctx.device_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(normalized["decryptionFailed"], true);
    assert_eq!(normalized["content"]["type"], "stub");

    let (delivery_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM webhook_deliveries d JOIN events e ON e.id = d.event_id
         WHERE e.device_id = $1",
    )
    .bind(ctx.device_id)
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(delivery_count, 1, "decryption stubs still fan out");
}

#[tokio::test]
async fn open_transition_expires_live_public_qr_links() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };

    let links = PublicQrLinkRepository::new(ctx.pool.clone());
    let link = links
        .create(&ctx.device_id, chrono::Duration::hours(24))
        .await
        .unwrap();
    assert!(link.is_valid(Utc::now()));

    ctx.transport
        .script_session(ctx.device_id, SessionScript::open("me@s.whatsapp.net"));
    ctx.manager.connect(ctx.device_id).await.unwrap();

    assert!(
        wait_until(|| async {
            let stored = links.get_by_token(&link.token).await.unwrap().unwrap();
            !stored.is_valid(Utc::now())
        })
        .await,
        "going ONLINE must expire every live QR link"
    );
}

#[tokio::test]
async fn stale_pending_deliveries_are_re_enqueued() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };
    ctx.add_endpoint(true).await;

    ctx.transport
        .script_session(ctx.device_id, SessionScript::open("me@s.whatsapp.net"));
    ctx.manager.connect(ctx.device_id).await.unwrap();
    ctx.transport
        .emit(
            &ctx.device_id,
            TransportEvent::MessagesUpsert {
                upsert_type: UpsertType::Notify,
                messages: vec![text_message("5491122223333@s.whatsapp.net", "hola")],
            },
        )
        .await;

    let deliveries = WebhookDeliveryRepository::new(ctx.pool.clone());
    assert!(
        wait_until(|| async {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM webhook_deliveries d JOIN events e ON e.id = d.event_id
                 WHERE e.device_id = $1 AND d.status = 'PENDING'",
            )
            .bind(ctx.device_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
            count == 1
        })
        .await
    );

    // A zero cutoff treats every PENDING row as stale, including the one
    // created above. Other leftover rows in a shared database may be swept
    // along, so assert at-least.
    let recovered = wagate_worker::dispatch::webhook::recover_stale_deliveries(
        &deliveries,
        &ctx.queues,
        chrono::Duration::zero(),
    )
    .await
    .unwrap();
    assert!(recovered >= 1);
}

#[tokio::test]
async fn corrupt_key_blobs_are_cleared_on_load() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };

    let vault = Vault::new(&[3u8; 32]).unwrap();
    let persisted = serde_json::json!({
        "creds": {"registrationId": 7},
        "keys": {
            "session": {"999:1": "###not-base64###"},
            "pre-keys": {"42": "AQID"},
        }
    });
    let token = vault
        .encrypt(&serde_json::to_vec(&persisted).unwrap())
        .unwrap();
    sqlx::query("INSERT INTO wa_sessions (device_id, auth_state_enc) VALUES ($1, $2)")
        .bind(ctx.device_id)
        .bind(&token)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let store = AuthStateStore::new(WaSessionRepository::new(ctx.pool.clone()), vault.clone());
    let _handle = store.load(ctx.device_id).await;

    // load() clears the session buckets and persists the cleaned document
    // before returning.
    let row = WaSessionRepository::new(ctx.pool.clone())
        .load(&ctx.device_id)
        .await
        .unwrap()
        .unwrap();
    let plaintext = vault.decrypt(&row.auth_state_enc).unwrap();
    let cleaned: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();

    assert_eq!(cleaned["creds"]["registrationId"], 7);
    assert!(cleaned["keys"].get("session").is_none());
    assert_eq!(cleaned["keys"]["pre-keys"]["42"], "AQID");
}

#[tokio::test]
async fn undecipherable_auth_state_is_deleted_for_fresh_pairing() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };

    sqlx::query("INSERT INTO wa_sessions (device_id, auth_state_enc) VALUES ($1, 'garbage')")
        .bind(ctx.device_id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let store = AuthStateStore::new(
        WaSessionRepository::new(ctx.pool.clone()),
        Vault::new(&[3u8; 32]).unwrap(),
    );
    let _handle = store.load(ctx.device_id).await;

    let row = WaSessionRepository::new(ctx.pool.clone())
        .load(&ctx.device_id)
        .await
        .unwrap();
    assert!(row.is_none(), "a blob the vault cannot open forces a fresh pairing");
}

#[tokio::test]
async fn logged_out_close_settles_offline_without_a_session() {
    let Some(ctx) = TestCtx::try_new().await else {
        return;
    };

    ctx.transport
        .script_session(ctx.device_id, SessionScript::open("me@s.whatsapp.net"));
    ctx.manager.connect(ctx.device_id).await.unwrap();
    assert!(wait_until(|| async { ctx.device_row().await.0 == "ONLINE" }).await);

    ctx.transport
        .emit(
            &ctx.device_id,
            TransportEvent::ConnectionUpdate(ConnectionUpdate {
                connection: Some(ConnectionState::Close),
                last_disconnect: Some(DisconnectInfo {
                    reason: DisconnectReason::LoggedOut,
                }),
                ..Default::default()
            }),
        )
        .await;

    assert!(
        wait_until(|| async {
            ctx.manager.get(&ctx.device_id).is_none() && ctx.device_row().await.0 == "OFFLINE"
        })
        .await,
        "logged-out close settles the device OFFLINE with no live session"
    );
    let (_, last_error) = ctx.device_row().await;
    assert_eq!(last_error.as_deref(), Some("logged_out"));
}
