use event_bus::{EventBus, NatsBus};
use std::sync::Arc;
use users_rs::config::Config;
use users_rs::db::{init_pool, run_migrations, PgStore};
use users_rs::metrics::Metrics;
use users_rs::{shutdown, topology, OutboxRelay};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();
    users_rs::init_tracing();

    tracing::info!("Starting outbox relay...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    let pool = init_pool(
        &config.database_url,
        config.db_max_connections,
        config.db_acquire_timeout,
    )
    .await
    .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    run_migrations(&pool).await.expect("Failed to run migrations");

    let mut store = PgStore::new(pool);
    if let Some(read_url) = &config.database_read_url {
        let read_pool = init_pool(read_url, config.db_max_connections, config.db_acquire_timeout)
            .await
            .expect("Failed to connect to read database");
        store = store.with_read_pool(read_pool);
    }

    tracing::info!(nats_url = %config.nats_url, "Connecting to NATS");
    let client = async_nats::connect(&config.nats_url)
        .await
        .expect("Failed to connect to NATS");
    let bus = NatsBus::new(client);

    topology::ensure_relay_topology(&bus, &config)
        .await
        .expect("Failed to reconcile stream");

    let metrics = Metrics::new().expect("Failed to register metrics");
    let bus: Arc<dyn EventBus> = Arc::new(bus);
    let relay = OutboxRelay::new(
        store,
        bus,
        config.subject_router(),
        config.relay_config(),
        metrics.clone(),
    );

    let shutdown_rx = shutdown::on_ctrl_c();
    if !config.metrics_log_interval.is_zero() {
        let metrics = metrics.clone();
        let interval = config.metrics_log_interval;
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { metrics.log_periodically(interval, shutdown_rx).await });
    }

    relay.run(shutdown_rx).await;

    if let Ok(text) = metrics.render() {
        tracing::info!(metrics = %text, "Final relay metrics");
    }
}
