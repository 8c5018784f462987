//! courier-dispatch-standalone: in-process smoke run
//!
//! Wires the in-memory backend and change feed, logs in a requester, a
//! dispatcher and a courier sharing one branch, and drives one delivery job
//! through its whole lifecycle:
//!
//! ```text
//! requester: create ─▶ AVAILABLE
//! courier:   claim  ─▶ ASSIGNED ─▶ start route ─▶ EN_ROUTE ─▶ deliver ─▶ DELIVERED
//! dispatcher:                                                 mark paid ─▶ PAID
//! ```
//!
//! Every session logs its bucket counts whenever its projection changes.
//! Set `DISPATCH_LOG=debug` to also see individual bucket moves.
//!
//! ## Configuration
//! ```yaml
//! feed:
//!   reconnect_min_delay_ms: 100
//!   stale_notice_after_secs: 30
//! sync:
//!   resync_interval_secs: 60
//! cache:
//!   namespace: dispatch
//!   path: /tmp/courier-dispatch
//! ```

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{error, info};

use courier_dispatch::bus::ChannelFeed;
use courier_dispatch::cache::{FileMessageCache, MemoryMessageCache, MessageCache};
use courier_dispatch::config::Config;
use courier_dispatch::model::{
    BranchId, NewService, PaymentMethod, ServiceId, SessionIdentity, UserId, ZoneCapacityConfig,
    ZoneId,
};
use courier_dispatch::storage::MemoryBackend;
use courier_dispatch::utils::bootstrap::{init_tracing, parse_config_path};
use courier_dispatch::{AppContext, SessionDeps};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Log a session's bucket counts on every projection change.
fn spawn_bucket_logger(label: &'static str, session: &AppContext) -> JoinHandle<()> {
    let reconciler = Arc::clone(session.view().reconciler());
    let mut revisions = reconciler.watch();
    tokio::spawn(async move {
        while revisions.changed().await.is_ok() {
            let counts: Vec<String> = reconciler
                .view()
                .bucket_names()
                .map(|name| format!("{name}={}", reconciler.bucket(name).len()))
                .collect();
            info!(session = label, buckets = %counts.join(" "), "Buckets changed");
        }
    })
}

/// Wait until `session` shows `service` in `bucket`.
async fn wait_for_bucket(
    session: &AppContext,
    service: ServiceId,
    bucket: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while session.view().bucket_of(service) != Some(bucket) {
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "{} session never saw service {service} in {bucket}",
                session.identity().role
            )
            .into());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting courier-dispatch-standalone");

    let feed = Arc::new(ChannelFeed::with_capacity(config.feed.queue_capacity));
    let backend = Arc::new(MemoryBackend::new(Arc::clone(&feed)));
    let cache: Arc<dyn MessageCache> = match &config.cache.path {
        Some(path) => Arc::new(FileMessageCache::open(path.clone()).await?),
        None => Arc::new(MemoryMessageCache::new()),
    };
    let deps = SessionDeps {
        api: backend,
        transport: feed,
        cache,
        config,
    };

    let branch = BranchId::new();
    let requester = AppContext::login(SessionIdentity::requester(UserId::new()), deps.clone()).await?;
    let dispatcher =
        AppContext::login(SessionIdentity::dispatcher(UserId::new(), branch), deps.clone()).await?;
    let courier = AppContext::login(SessionIdentity::courier(UserId::new(), branch), deps).await?;

    let loggers = [
        spawn_bucket_logger("requester", &requester),
        spawn_bucket_logger("dispatcher", &dispatcher),
        spawn_bucket_logger("courier", &courier),
    ];

    dispatcher
        .governor()
        .set_config(
            dispatcher.identity(),
            branch,
            ZoneCapacityConfig {
                branch_ref: branch,
                low_demand_enabled: true,
                max_concurrent_services_per_courier: 2,
            },
        )
        .await?;

    let service = requester
        .create_service(NewService {
            destination_address: "Carrera 15 #93-47".to_string(),
            client_phone: "310 555 0188".to_string(),
            client_name: "Camila Rojas".to_string(),
            payment_method: PaymentMethod::Cash,
            amount_to_collect: Decimal::new(4500000, 2),
            notes: Some("Ring twice".to_string()),
            branch_ref: Some(branch),
            ..NewService::default()
        })
        .await?;
    wait_for_bucket(&courier, service.id, "available").await?;
    wait_for_bucket(&dispatcher, service.id, "available").await?;

    courier.claim(service.id).await?;
    wait_for_bucket(&requester, service.id, "in_progress").await?;

    requester
        .send_message(service.id, "The doorman has the package")
        .await?;
    courier.start_route(service.id, Some(ZoneId::new())).await?;
    wait_for_bucket(&dispatcher, service.id, "en_route").await?;

    courier.mark_delivered(service.id).await?;
    wait_for_bucket(&dispatcher, service.id, "delivered").await?;

    dispatcher.mark_paid(service.id).await?;
    wait_for_bucket(&requester, service.id, "completed").await?;

    let thread = courier.thread(service.id).await?;
    info!(
        messages = thread.len(),
        unread = courier.unread_count(service.id),
        "Courier thread"
    );
    courier.mark_read(service.id);

    for session in [&requester, &dispatcher, &courier] {
        session.logout().await;
    }
    for logger in loggers {
        logger.abort();
    }

    info!(service_id = %service.id, "Lifecycle scenario complete");
    Ok(())
}
